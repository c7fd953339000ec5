//! [`SimRadio`] – in-process radio stack for tests and the shell.
//!
//! [`SimRadio`] implements [`RadioStack`] without a coordinator.  The paired
//! [`SimRadioHandle`] plays the part of the mesh: it makes devices join,
//! leave, announce and report attributes, and it exposes what the bridge
//! asked of the radio.
//!
//! | Command | Stub behaviour |
//! |---|---|
//! | `start` | records the event sender; fails when built with [`failing_start`](SimRadioBuilder::failing_start) |
//! | `permit` | appends the duration to [`permits`](SimRadioHandle::permits); `NotStarted` before `start` |
//! | `devices` | returns the devices currently paired |
//! | `force_leave` | unpairs the device and emits `DeviceLeft`; fails when built with [`failing_force_leave`](SimRadioBuilder::failing_force_leave) |
//!
//! # Example
//!
//! ```rust
//! use meshbridge_hal::sim_radio::SimRadio;
//!
//! let (radio, handle) = SimRadio::builder()
//!     .with_paired("00:11:22:33:44:55:66:77".parse().unwrap(), "TS0001", "TuYa")
//!     .build();
//! assert!(!handle.is_started());
//! # drop(radio);
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use meshbridge_types::{BridgeError, DeviceId};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::radio::{RadioConfig, RadioDevice, RadioEvent, RadioStack};

// ─────────────────────────────────────────────────────────────────────────────
// Shared state
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct SimState {
    events: Option<mpsc::Sender<RadioEvent>>,
    config: Option<RadioConfig>,
    paired: Vec<RadioDevice>,
    permits: Vec<u16>,
    force_left: Vec<DeviceId>,
    fail_start: bool,
    fail_permit: bool,
    fail_force_leave: bool,
    next_nwk: u16,
}

impl SimState {
    fn allocate_nwk(&mut self) -> u16 {
        self.next_nwk = self.next_nwk.wrapping_add(1).max(1);
        self.next_nwk
    }
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ─────────────────────────────────────────────────────────────────────────────
// SimRadio
// ─────────────────────────────────────────────────────────────────────────────

/// Stub [`RadioStack`].
pub struct SimRadio {
    state: Arc<Mutex<SimState>>,
}

impl SimRadio {
    pub fn builder() -> SimRadioBuilder {
        SimRadioBuilder::default()
    }
}

#[async_trait]
impl RadioStack for SimRadio {
    async fn start(
        &mut self,
        config: &RadioConfig,
        events: mpsc::Sender<RadioEvent>,
    ) -> Result<(), BridgeError> {
        let mut st = lock(&self.state);
        if st.fail_start {
            return Err(BridgeError::radio("start", "coordinator did not respond"));
        }
        debug!(port = %config.serial_port, channel = config.channel, "sim radio started");
        st.config = Some(config.clone());
        st.events = Some(events);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), BridgeError> {
        let mut st = lock(&self.state);
        st.events = None;
        st.config = None;
        Ok(())
    }

    async fn permit(&mut self, secs: u16) -> Result<(), BridgeError> {
        let mut st = lock(&self.state);
        if st.events.is_none() {
            return Err(BridgeError::NotStarted);
        }
        if st.fail_permit {
            return Err(BridgeError::radio("permit", "coordinator refused permit"));
        }
        st.permits.push(secs);
        Ok(())
    }

    async fn devices(&self) -> Result<Vec<RadioDevice>, BridgeError> {
        Ok(lock(&self.state).paired.clone())
    }

    async fn force_leave(&mut self, device: &DeviceId) -> Result<(), BridgeError> {
        let tx = {
            let mut st = lock(&self.state);
            if st.fail_force_leave {
                return Err(BridgeError::radio("force_leave", "no route to device"));
            }
            st.force_left.push(*device);
            st.paired.retain(|d| d.ieee != *device);
            st.events.clone()
        };
        // Called from the event consumer itself, so never wait for room.
        if let Some(tx) = tx
            && let Err(e) = tx.try_send(RadioEvent::DeviceLeft { ieee: *device })
        {
            warn!(device = %device, error = %e, "leave event dropped");
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for a [`SimRadio`] and its [`SimRadioHandle`].
#[derive(Default)]
pub struct SimRadioBuilder {
    paired: Vec<(DeviceId, String, String)>,
    fail_start: bool,
    fail_permit: bool,
    fail_force_leave: bool,
}

impl SimRadioBuilder {
    /// Pre-pair a device, as if it were already in the coordinator's database.
    pub fn with_paired(
        mut self,
        ieee: DeviceId,
        model: impl Into<String>,
        manufacturer: impl Into<String>,
    ) -> Self {
        self.paired.push((ieee, model.into(), manufacturer.into()));
        self
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn failing_permit(mut self) -> Self {
        self.fail_permit = true;
        self
    }

    pub fn failing_force_leave(mut self) -> Self {
        self.fail_force_leave = true;
        self
    }

    pub fn build(self) -> (SimRadio, SimRadioHandle) {
        let mut st = SimState {
            fail_start: self.fail_start,
            fail_permit: self.fail_permit,
            fail_force_leave: self.fail_force_leave,
            ..SimState::default()
        };
        for (ieee, model, manufacturer) in self.paired {
            let nwk = st.allocate_nwk();
            st.paired.push(RadioDevice {
                ieee,
                model: Some(model),
                manufacturer: Some(manufacturer),
                nwk,
            });
        }
        let state = Arc::new(Mutex::new(st));
        (
            SimRadio {
                state: Arc::clone(&state),
            },
            SimRadioHandle { state },
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────────────────────────

/// The simulated mesh side of a [`SimRadio`].
///
/// Event methods return `false` when the radio is not started (nothing is
/// listening).
#[derive(Clone)]
pub struct SimRadioHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimRadioHandle {
    /// A device joins (and is paired).
    pub async fn join(
        &self,
        ieee: DeviceId,
        model: Option<&str>,
        manufacturer: Option<&str>,
    ) -> bool {
        let (tx, device) = {
            let mut st = lock(&self.state);
            let nwk = st.allocate_nwk();
            let device = RadioDevice {
                ieee,
                model: model.map(str::to_string),
                manufacturer: manufacturer.map(str::to_string),
                nwk,
            };
            st.paired.retain(|d| d.ieee != ieee);
            st.paired.push(device.clone());
            (st.events.clone(), device)
        };
        deliver(tx, RadioEvent::DeviceJoined(device)).await
    }

    /// A device leaves on its own.
    pub async fn leave(&self, ieee: DeviceId) -> bool {
        let tx = {
            let mut st = lock(&self.state);
            st.paired.retain(|d| d.ieee != ieee);
            st.events.clone()
        };
        deliver(tx, RadioEvent::DeviceLeft { ieee }).await
    }

    pub async fn announce(&self, ieee: DeviceId) -> bool {
        let tx = lock(&self.state).events.clone();
        deliver(tx, RadioEvent::DeviceAnnounce { ieee }).await
    }

    pub async fn report(&self, ieee: DeviceId, cluster: u16, attribute: u16, value: Value) -> bool {
        let tx = lock(&self.state).events.clone();
        deliver(
            tx,
            RadioEvent::AttributeReport {
                ieee,
                cluster,
                attribute,
                value,
            },
        )
        .await
    }

    pub fn is_started(&self) -> bool {
        lock(&self.state).events.is_some()
    }

    /// Configuration the radio was last started with.
    pub fn config(&self) -> Option<RadioConfig> {
        lock(&self.state).config.clone()
    }

    /// Every `permit` duration requested so far, in order.
    pub fn permits(&self) -> Vec<u16> {
        lock(&self.state).permits.clone()
    }

    /// Every device the bridge asked to leave, in order.
    pub fn force_left(&self) -> Vec<DeviceId> {
        lock(&self.state).force_left.clone()
    }

    pub fn paired(&self) -> Vec<RadioDevice> {
        lock(&self.state).paired.clone()
    }
}

async fn deliver(tx: Option<mpsc::Sender<RadioEvent>>, event: RadioEvent) -> bool {
    match tx {
        Some(tx) => tx.send(event).await.is_ok(),
        None => false,
    }
}
