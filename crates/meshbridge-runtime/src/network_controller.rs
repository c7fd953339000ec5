//! [`NetworkController`] – single owner of the radio network.
//!
//! The controller runs as one Tokio task and is the only code that mutates
//! the device map, the [`StateStore`] or talks to the [`RadioStack`].  It
//! multiplexes three inputs:
//!
//! 1. **Commands** – [`CommandEnvelope`]s sent by [`ControllerHandle`], each
//!    answered on its own `oneshot`.
//! 2. **Radio events** – joins, leaves, announces and attribute reports
//!    pushed by the radio stack on a bounded channel.
//! 3. **Permit-join deadline** – a timer branch that closes the join window
//!    when it expires.
//!
//! After every input the controller publishes an immutable
//! [`NetworkSnapshot`] on a `watch` channel; readers never queue behind a
//! slow radio operation.
//!
//! # Device lifecycle
//!
//! | Input | Effect |
//! |---|---|
//! | `DeviceJoined` | device inserted as `Joining` with a fresh state map, `device_joined` published |
//! | `DeviceAnnounce` | known device becomes `Online`, `device_announce` published |
//! | `AttributeReport` | known device becomes `Online`; mapped attribute validated and stored, state + raw attribute published |
//! | `DeviceLeft` | device and state dropped, `device_leave` published |
//! | `remove_device` | force-leave through the radio, then device and state dropped, `device_removed` published |
//!
//! # Fault isolation
//!
//! Every event handler and command runs behind `catch_unwind`.  A failing or
//! panicking handler is logged with its device context and the loop keeps
//! going; a panicking command drops its reply, which the caller sees as
//! [`BridgeError::ControllerUnavailable`].

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use meshbridge_hal::{RadioConfig, RadioDevice, RadioEvent, RadioStack};
use meshbridge_kernel::{
    CapabilityRegistry, PermitJoinWindow, StateStore, validate_duration,
};
use meshbridge_middleware::BusGateway;
use meshbridge_middleware::topics::{self, BridgeEvent};
use meshbridge_types::{BridgeError, Device, DeviceId, DeviceStatus, StateMap};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// How long a caller waits for the controller to answer a command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

const COMMAND_CHANNEL_SIZE: usize = 64;
const EVENT_CHANNEL_SIZE: usize = 256;

/// Model and manufacturer recorded when the radio did not report them.
const UNKNOWN: &str = "unknown";

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

/// Mutating operations executed on the controller task.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerCommand {
    Start,
    Stop,
    PermitJoin { secs: u16 },
    ClosePermitJoin,
    UpdateState {
        device: DeviceId,
        state: String,
        value: Value,
    },
    RemoveDevice { device: DeviceId },
    /// Stop the radio and end the controller task.
    Shutdown,
}

impl ControllerCommand {
    fn name(&self) -> &'static str {
        match self {
            ControllerCommand::Start => "start",
            ControllerCommand::Stop => "stop",
            ControllerCommand::PermitJoin { .. } => "permit_join",
            ControllerCommand::ClosePermitJoin => "close_permit_join",
            ControllerCommand::UpdateState { .. } => "update_state",
            ControllerCommand::RemoveDevice { .. } => "remove_device",
            ControllerCommand::Shutdown => "shutdown",
        }
    }
}

/// A command plus the channel its result is returned on.
pub struct CommandEnvelope {
    pub command: ControllerCommand,
    pub response_tx: oneshot::Sender<Result<(), BridgeError>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Snapshot
// ─────────────────────────────────────────────────────────────────────────────

/// Read-only view of the network published after every controller step.
///
/// Devices and state maps are captured together, so a device is present in
/// `devices` exactly when it has an entry in `states`.
#[derive(Debug, Clone, Default)]
pub struct NetworkSnapshot {
    pub radio_started: bool,
    pub devices: BTreeMap<DeviceId, Device>,
    pub states: HashMap<DeviceId, StateMap>,
    pub permit_join: PermitJoinWindow,
}

impl NetworkSnapshot {
    pub fn device(&self, id: &DeviceId) -> Option<&Device> {
        self.devices.get(id)
    }

    /// State map of `id`; empty when the device is unknown.
    pub fn state(&self, id: &DeviceId) -> StateMap {
        self.states.get(id).cloned().unwrap_or_default()
    }

    /// Join window state, expiring lazily at the deadline.
    pub fn permit_join_active(&self, now: Instant) -> bool {
        self.permit_join.is_open_at(now.into_std())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Cloneable front door of the controller task.
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<CommandEnvelope>,
    snapshot: watch::Receiver<Arc<NetworkSnapshot>>,
    timeout: Duration,
}

impl ControllerHandle {
    /// Send `command` and wait for its result, at most the configured
    /// command timeout.  A timed-out command is not cancelled.
    pub async fn request(&self, command: ControllerCommand) -> Result<(), BridgeError> {
        let operation = command.name();
        let exchange = async {
            let (response_tx, response_rx) = oneshot::channel();
            self.commands
                .send(CommandEnvelope {
                    command,
                    response_tx,
                })
                .await
                .map_err(|_| BridgeError::ControllerUnavailable)?;
            response_rx
                .await
                .map_err(|_| BridgeError::ControllerUnavailable)?
        };
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, timeout_secs = self.timeout.as_secs(), "controller did not answer in time");
                Err(BridgeError::Timeout {
                    operation: operation.to_string(),
                })
            }
        }
    }

    pub async fn start(&self) -> Result<(), BridgeError> {
        self.request(ControllerCommand::Start).await
    }

    pub async fn stop(&self) -> Result<(), BridgeError> {
        self.request(ControllerCommand::Stop).await
    }

    pub async fn permit_join(&self, secs: u16) -> Result<(), BridgeError> {
        self.request(ControllerCommand::PermitJoin { secs }).await
    }

    pub async fn close_permit_join(&self) -> Result<(), BridgeError> {
        self.request(ControllerCommand::ClosePermitJoin).await
    }

    pub async fn update_state(
        &self,
        device: DeviceId,
        state: impl Into<String>,
        value: Value,
    ) -> Result<(), BridgeError> {
        self.request(ControllerCommand::UpdateState {
            device,
            state: state.into(),
            value,
        })
        .await
    }

    pub async fn remove_device(&self, device: DeviceId) -> Result<(), BridgeError> {
        self.request(ControllerCommand::RemoveDevice { device }).await
    }

    pub async fn shutdown(&self) -> Result<(), BridgeError> {
        self.request(ControllerCommand::Shutdown).await
    }

    // -----------------------------------------------------------------------
    // Read side
    // -----------------------------------------------------------------------

    pub fn snapshot(&self) -> Arc<NetworkSnapshot> {
        Arc::clone(&self.snapshot.borrow())
    }

    /// Follow snapshot updates.
    pub fn subscribe(&self) -> watch::Receiver<Arc<NetworkSnapshot>> {
        self.snapshot.clone()
    }

    pub fn devices(&self) -> Vec<Device> {
        self.snapshot().devices.values().cloned().collect()
    }

    pub fn device(&self, id: &DeviceId) -> Option<Device> {
        self.snapshot().device(id).cloned()
    }

    pub fn device_state(&self, id: &DeviceId) -> StateMap {
        self.snapshot().state(id)
    }

    pub fn is_started(&self) -> bool {
        self.snapshot().radio_started
    }

    pub fn is_permit_join_active(&self) -> bool {
        self.snapshot().permit_join_active(Instant::now())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Controller
// ─────────────────────────────────────────────────────────────────────────────

/// Owner of the device map, the state store, the join window and the radio.
pub struct NetworkController {
    radio: Box<dyn RadioStack>,
    radio_config: RadioConfig,
    registry: Arc<CapabilityRegistry>,
    gateway: Arc<BusGateway>,
    devices: BTreeMap<DeviceId, Device>,
    store: StateStore,
    window: PermitJoinWindow,
    /// Deadline of the armed deferred close.
    close_at: Option<Instant>,
    started: bool,
    events_tx: mpsc::Sender<RadioEvent>,
    events_rx: mpsc::Receiver<RadioEvent>,
    snapshot: watch::Sender<Arc<NetworkSnapshot>>,
}

impl NetworkController {
    pub fn new(
        radio: Box<dyn RadioStack>,
        radio_config: RadioConfig,
        registry: Arc<CapabilityRegistry>,
        gateway: Arc<BusGateway>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (snapshot, _) = watch::channel(Arc::new(NetworkSnapshot::default()));
        Self {
            radio,
            radio_config,
            store: StateStore::new(Arc::clone(&registry)),
            registry,
            gateway,
            devices: BTreeMap::new(),
            window: PermitJoinWindow::default(),
            close_at: None,
            started: false,
            events_tx,
            events_rx,
            snapshot,
        }
    }

    /// Spawn the controller task and return its handle.
    pub fn spawn(self, command_timeout: Duration) -> (ControllerHandle, JoinHandle<()>) {
        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let handle = ControllerHandle {
            commands,
            snapshot: self.snapshot.subscribe(),
            timeout: command_timeout,
        };
        let task = tokio::spawn(self.run(command_rx));
        (handle, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<CommandEnvelope>) {
        info!("network controller running");
        loop {
            let deadline = self.close_at.unwrap_or_else(Instant::now);
            tokio::select! {
                biased;
                envelope = commands.recv() => {
                    let Some(CommandEnvelope { command, response_tx }) = envelope else {
                        break;
                    };
                    let shutdown = matches!(command, ControllerCommand::Shutdown);
                    self.guarded_command(command, response_tx).await;
                    if shutdown {
                        break;
                    }
                }
                () = sleep_until(deadline), if self.close_at.is_some() => {
                    self.close_at = None;
                    debug!("permit-join window expired");
                    self.close_window().await;
                }
                Some(event) = self.events_rx.recv() => {
                    self.guarded_event(event).await;
                }
            }
            self.publish_snapshot();
        }
        if self.started {
            self.shutdown_radio().await;
            self.publish_snapshot();
        }
        info!("network controller stopped");
    }

    fn publish_snapshot(&self) {
        let snapshot = NetworkSnapshot {
            radio_started: self.started,
            devices: self.devices.clone(),
            states: self.store.snapshot(),
            permit_join: self.window.clone(),
        };
        self.snapshot.send_replace(Arc::new(snapshot));
    }

    // -----------------------------------------------------------------------
    // Isolation boundaries
    // -----------------------------------------------------------------------

    async fn guarded_command(
        &mut self,
        command: ControllerCommand,
        response_tx: oneshot::Sender<Result<(), BridgeError>>,
    ) {
        let operation = command.name();
        let outcome = AssertUnwindSafe(self.execute(command)).catch_unwind().await;
        // Readers woken by the reply must already see the command's effect.
        self.publish_snapshot();
        match outcome {
            Ok(result) => {
                if let Err(e) = &result {
                    debug!(operation, error = %e, "command failed");
                }
                let _ = response_tx.send(result);
            }
            Err(panic) => {
                error!(operation, panic = panic_message(&*panic), "command handler panicked");
            }
        }
    }

    async fn guarded_event(&mut self, event: RadioEvent) {
        let device = event.device();
        let (cluster, attribute) = match &event {
            RadioEvent::AttributeReport {
                cluster, attribute, ..
            } => (Some(*cluster), Some(*attribute)),
            _ => (None, None),
        };
        match AssertUnwindSafe(self.on_event(event)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(device = %device, ?cluster, ?attribute, error = %e, "radio event handler failed");
            }
            Err(panic) => {
                error!(
                    device = %device,
                    ?cluster,
                    ?attribute,
                    panic = panic_message(&*panic),
                    "radio event handler panicked"
                );
            }
        }
    }

    async fn execute(&mut self, command: ControllerCommand) -> Result<(), BridgeError> {
        match command {
            ControllerCommand::Start => self.start().await,
            ControllerCommand::Stop => self.stop().await,
            ControllerCommand::PermitJoin { secs } => self.permit_join(secs).await,
            ControllerCommand::ClosePermitJoin => {
                self.close_window().await;
                Ok(())
            }
            ControllerCommand::UpdateState {
                device,
                state,
                value,
            } => self.update_state(device, &state, value).await,
            ControllerCommand::RemoveDevice { device } => self.remove_device(device).await,
            ControllerCommand::Shutdown => self.stop().await,
        }
    }

    async fn on_event(&mut self, event: RadioEvent) -> Result<(), BridgeError> {
        match event {
            RadioEvent::DeviceJoined(dev) => self.on_device_joined(dev).await,
            RadioEvent::DeviceLeft { ieee } => self.on_device_left(ieee).await,
            RadioEvent::DeviceAnnounce { ieee } => self.on_device_announce(ieee).await,
            RadioEvent::AttributeReport {
                ieee,
                cluster,
                attribute,
                value,
            } => self.on_attribute_report(ieee, cluster, attribute, value).await,
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    async fn start(&mut self) -> Result<(), BridgeError> {
        if self.started {
            debug!("radio already started");
            return Ok(());
        }
        self.radio_config.validate()?;

        let config = RadioConfig {
            auto_form: true,
            ..self.radio_config.clone()
        };
        if let Err(e) = self.radio.start(&config, self.events_tx.clone()).await {
            error!(port = %config.serial_port, error = %e, "radio start failed");
            if let Err(stop_err) = self.radio.stop().await {
                warn!(error = %stop_err, "radio stop after failed start also failed");
            }
            return Err(e);
        }
        self.started = true;
        info!(
            port = %config.serial_port,
            channel = config.channel,
            pan_id = %format!("{:#06x}", config.pan_id),
            "radio network started"
        );

        match self.radio.devices().await {
            Ok(paired) => {
                let count = paired.len();
                for dev in paired {
                    self.admit(dev, DeviceStatus::Online);
                }
                if count > 0 {
                    info!(count, "restored paired devices");
                }
            }
            Err(e) => warn!(error = %e, "could not enumerate paired devices"),
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), BridgeError> {
        if !self.started {
            return Ok(());
        }
        self.close_window().await;
        let result = self.radio.stop().await;
        self.started = false;
        info!("radio network stopped");
        result
    }

    async fn shutdown_radio(&mut self) {
        if let Err(e) = self.stop().await {
            warn!(error = %e, "radio stop during shutdown failed");
        }
    }

    // -----------------------------------------------------------------------
    // Permit join
    // -----------------------------------------------------------------------

    async fn permit_join(&mut self, secs: u16) -> Result<(), BridgeError> {
        if !self.started {
            return Err(BridgeError::NotStarted);
        }
        let duration = validate_duration(secs)?;
        self.radio.permit(secs).await?;

        let now = Instant::now();
        self.window.open(now.into_std(), duration);
        self.close_at = Some(now + duration);
        info!(secs, "permit join opened");

        let gw = &self.gateway;
        gw.publish(&gw.topics().permit_join(), &topics::permit_join_payload(Some(secs)))
            .await;
        Ok(())
    }

    /// Close an open join window, asking the radio to stop admitting
    /// devices.  Radio failures are logged.
    async fn close_window(&mut self) {
        self.close_at = None;
        if !self.window.close() {
            return;
        }
        if self.started
            && let Err(e) = self.radio.permit(0).await
        {
            warn!(error = %e, "radio refused to close permit join");
        }
        info!("permit join closed");
        let gw = &self.gateway;
        gw.publish(&gw.topics().permit_join(), &topics::permit_join_payload(None))
            .await;
    }

    // -----------------------------------------------------------------------
    // Device commands
    // -----------------------------------------------------------------------

    async fn update_state(
        &mut self,
        device: DeviceId,
        state: &str,
        value: Value,
    ) -> Result<(), BridgeError> {
        self.store.update(&device, state, value.clone())?;
        let gw = &self.gateway;
        gw.publish(&gw.topics().state(&device), &topics::state_payload(state, &value))
            .await;
        Ok(())
    }

    async fn remove_device(&mut self, device: DeviceId) -> Result<(), BridgeError> {
        if !self.devices.contains_key(&device) {
            return Err(BridgeError::UnknownDevice(device));
        }
        self.radio.force_leave(&device).await.map_err(|e| match e {
            BridgeError::Radio { .. } => e,
            other => BridgeError::radio("force_leave", other),
        })?;

        if let Some(mut removed) = self.devices.remove(&device) {
            removed.status = DeviceStatus::Removed;
            info!(device = %device, model = %removed.model_id, "device removed");
        }
        self.store.remove(&device);

        let gw = &self.gateway;
        gw.publish(
            &gw.topics().event(BridgeEvent::DeviceRemoved),
            &topics::device_ref_payload(&device),
        )
        .await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Radio events
    // -----------------------------------------------------------------------

    /// Insert `dev` into the device map with a fresh state map.
    fn admit(&mut self, dev: RadioDevice, status: DeviceStatus) -> &Device {
        let model_id = dev.model.unwrap_or_else(|| UNKNOWN.to_string());
        let reported_manufacturer = dev.manufacturer.as_deref();
        let definition = self.registry.identify(&model_id, reported_manufacturer);
        let manufacturer = dev.manufacturer.unwrap_or_else(|| UNKNOWN.to_string());

        match &definition {
            Some(def) => {
                let names: Vec<&str> = def.state_names().collect();
                self.store.insert(dev.ieee, &def.model_id, names);
            }
            None => {
                warn!(device = %dev.ieee, model = %model_id, "no capability definition for device");
                self.store.insert(dev.ieee, &model_id, std::iter::empty::<&str>());
            }
        }

        let now = Utc::now();
        let device = Device {
            id: dev.ieee,
            model_id,
            manufacturer,
            definition_model: definition.as_ref().map(|d| d.model_id.clone()),
            supported_features: definition
                .as_ref()
                .map(|d| d.supports.clone())
                .unwrap_or_default(),
            status,
            last_seen: now,
            joined_at: now,
        };
        self.devices.insert(dev.ieee, device);
        &self.devices[&dev.ieee]
    }

    async fn on_device_joined(&mut self, dev: RadioDevice) {
        let device = self.admit(dev, DeviceStatus::Joining).clone();
        info!(
            device = %device.id,
            model = %device.model_id,
            manufacturer = %device.manufacturer,
            "device joined"
        );
        let gw = &self.gateway;
        gw.publish(
            &gw.topics().event(BridgeEvent::DeviceJoined),
            &topics::device_joined_payload(&device),
        )
        .await;
    }

    async fn on_device_left(&mut self, ieee: DeviceId) {
        let Some(mut device) = self.devices.remove(&ieee) else {
            debug!(device = %ieee, "leave from unknown device ignored");
            return;
        };
        self.store.remove(&ieee);
        device.status = DeviceStatus::Leaving;
        info!(device = %ieee, model = %device.model_id, "device left");

        let gw = &self.gateway;
        gw.publish(
            &gw.topics().event(BridgeEvent::DeviceLeave),
            &topics::device_ref_payload(&ieee),
        )
        .await;
    }

    async fn on_device_announce(&mut self, ieee: DeviceId) {
        let Some(device) = self.devices.get_mut(&ieee) else {
            debug!(device = %ieee, "announce from unknown device ignored");
            return;
        };
        device.status = DeviceStatus::Online;
        device.last_seen = Utc::now();
        debug!(device = %ieee, "device announced");

        let gw = &self.gateway;
        gw.publish(
            &gw.topics().event(BridgeEvent::DeviceAnnounce),
            &topics::device_ref_payload(&ieee),
        )
        .await;
    }

    async fn on_attribute_report(
        &mut self,
        ieee: DeviceId,
        cluster: u16,
        attribute: u16,
        value: Value,
    ) {
        let Some(device) = self.devices.get_mut(&ieee) else {
            debug!(device = %ieee, cluster, attribute, "report from unknown device ignored");
            return;
        };
        device.status = DeviceStatus::Online;
        device.last_seen = Utc::now();
        let device = device.clone();

        let Some(definition) = device
            .definition_model
            .as_deref()
            .and_then(|model| self.registry.definition(model))
        else {
            debug!(device = %ieee, cluster, attribute, "report from unidentified device ignored");
            return;
        };
        let Some(property) = definition.property_for(cluster, attribute) else {
            debug!(device = %ieee, cluster, attribute, "unmapped attribute ignored");
            return;
        };

        let gw = &self.gateway;
        match self.store.update(&ieee, &property.name, value.clone()) {
            Ok(()) => {
                gw.publish(&gw.topics().state(&ieee), &topics::state_payload(&property.name, &value))
                    .await;
            }
            Err(e) => {
                warn!(
                    device = %ieee,
                    model = %device.model_id,
                    cluster,
                    attribute,
                    state = %property.name,
                    value = %value,
                    error = %e,
                    "attribute report rejected"
                );
            }
        }
        gw.publish(
            &gw.topics().attribute(&ieee),
            &topics::attribute_payload(&device, cluster, attribute, &value),
        )
        .await;
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use meshbridge_hal::{SimRadio, SimRadioHandle};
    use meshbridge_kernel::CapabilityDefinition;
    use meshbridge_middleware::{BusTransport, LoopbackBroker, Topics};
    use serde_json::json;
    use std::collections::BTreeSet;

    // ---- helpers ----

    const TS0001: &str = r#"{
        "model_id": "TS0001",
        "vendor": "TuYa",
        "supports": ["on_off", "brightness"],
        "exposes": [
            {"type": "binary", "name": "state", "values": ["ON", "OFF"], "cluster": 6, "attribute": 0},
            {"type": "numeric", "name": "brightness", "value_min": 0, "value_max": 254, "cluster": 8, "attribute": 0}
        ]
    }"#;

    fn ieee(last: u8) -> DeviceId {
        DeviceId::from_bytes([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff, 0x00, last])
    }

    fn registry() -> Arc<CapabilityRegistry> {
        let mut reg = CapabilityRegistry::new();
        reg.insert(CapabilityDefinition::from_json(TS0001).unwrap());
        Arc::new(reg)
    }

    struct Rig {
        handle: ControllerHandle,
        radio: SimRadioHandle,
        broker: Arc<LoopbackBroker>,
    }

    async fn rig_with(radio: SimRadio, sim: SimRadioHandle) -> Rig {
        let broker = Arc::new(LoopbackBroker::new());
        let gateway = Arc::new(BusGateway::new(broker.clone(), Topics::default()));
        gateway.connect("127.0.0.1", 1883, None, None).await.unwrap();
        let controller = NetworkController::new(
            Box::new(radio),
            RadioConfig::default(),
            registry(),
            gateway,
        );
        let (handle, _task) = controller.spawn(DEFAULT_COMMAND_TIMEOUT);
        Rig {
            handle,
            radio: sim,
            broker,
        }
    }

    async fn started_rig() -> Rig {
        let (radio, sim) = SimRadio::builder().build();
        let rig = rig_with(radio, sim).await;
        rig.handle.start().await.unwrap();
        rig
    }

    /// Wait until the controller has published a snapshot satisfying `f`.
    async fn settle(handle: &ControllerHandle, f: impl Fn(&NetworkSnapshot) -> bool) {
        let mut rx = handle.subscribe();
        rx.wait_for(|s| f(s.as_ref())).await.unwrap();
    }

    async fn join_switch(rig: &Rig, id: DeviceId) {
        assert!(rig.radio.join(id, Some("TS0001"), Some("TuYa")).await);
        settle(&rig.handle, |s| s.devices.contains_key(&id)).await;
    }

    // ---- lifecycle ----

    #[tokio::test]
    async fn start_forms_network_and_restores_paired_devices() {
        let (radio, sim) = SimRadio::builder()
            .with_paired(ieee(1), "TS0001", "TuYa")
            .build();
        let rig = rig_with(radio, sim).await;
        rig.handle.start().await.unwrap();

        assert!(rig.handle.is_started());
        assert!(rig.radio.config().unwrap().auto_form);
        let device = rig.handle.device(&ieee(1)).unwrap();
        assert_eq!(device.status, DeviceStatus::Online);
        assert_eq!(rig.handle.device_state(&ieee(1))["state"], Value::Null);
    }

    #[tokio::test]
    async fn failed_start_leaves_controller_stopped() {
        let (radio, sim) = SimRadio::builder().failing_start().build();
        let rig = rig_with(radio, sim).await;
        let err = rig.handle.start().await.unwrap_err();
        assert!(matches!(err, BridgeError::Radio { .. }));
        assert!(!rig.handle.is_started());
        assert_eq!(
            rig.handle.permit_join(60).await,
            Err(BridgeError::NotStarted)
        );
    }

    #[tokio::test]
    async fn invalid_radio_config_is_rejected_before_start() {
        let (radio, sim) = SimRadio::builder().build();
        let broker = Arc::new(LoopbackBroker::new());
        let gateway = Arc::new(BusGateway::new(broker, Topics::default()));
        let controller = NetworkController::new(
            Box::new(radio),
            RadioConfig {
                channel: 5,
                ..RadioConfig::default()
            },
            registry(),
            gateway,
        );
        let (handle, _task) = controller.spawn(DEFAULT_COMMAND_TIMEOUT);
        assert!(matches!(
            handle.start().await,
            Err(BridgeError::Configuration(_))
        ));
        assert!(sim.config().is_none());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let rig = started_rig().await;
        rig.handle.stop().await.unwrap();
        rig.handle.stop().await.unwrap();
        assert!(!rig.handle.is_started());
        assert!(!rig.radio.is_started());
    }

    // ---- permit join ----

    #[tokio::test(start_paused = true)]
    async fn permit_join_opens_and_closes_itself() {
        let rig = started_rig().await;
        rig.handle.permit_join(60).await.unwrap();
        assert!(rig.handle.is_permit_join_active());
        assert_eq!(
            rig.broker.published_on("bridge/bridge/request/permit_join"),
            vec![json!({"value": true, "time": 60})]
        );

        tokio::time::sleep(Duration::from_secs(61)).await;
        settle(&rig.handle, |s| s.permit_join.remaining(std::time::Instant::now()).is_none()).await;

        assert!(!rig.handle.is_permit_join_active());
        assert_eq!(rig.radio.permits(), vec![60, 0]);
        assert_eq!(
            rig.broker.published_on("bridge/bridge/request/permit_join"),
            vec![json!({"value": true, "time": 60}), json!({"value": false})]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn permit_join_expires_lazily_for_readers() {
        let rig = started_rig().await;
        rig.handle.permit_join(60).await.unwrap();
        let snapshot = rig.handle.snapshot();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!snapshot.permit_join_active(Instant::now()));
    }

    #[tokio::test]
    async fn permit_join_duration_bounds() {
        let rig = started_rig().await;
        assert!(matches!(
            rig.handle.permit_join(0).await,
            Err(BridgeError::Configuration(_))
        ));
        assert!(matches!(
            rig.handle.permit_join(255).await,
            Err(BridgeError::Configuration(_))
        ));
        rig.handle.permit_join(254).await.unwrap();
        assert_eq!(rig.radio.permits(), vec![254]);
    }

    #[tokio::test]
    async fn radio_permit_failure_keeps_window_closed() {
        let (radio, sim) = SimRadio::builder().failing_permit().build();
        let rig = rig_with(radio, sim).await;
        rig.handle.start().await.unwrap();
        assert!(matches!(
            rig.handle.permit_join(60).await,
            Err(BridgeError::Radio { .. })
        ));
        assert!(!rig.handle.is_permit_join_active());
    }

    #[tokio::test]
    async fn close_permit_join_publishes_once() {
        let rig = started_rig().await;
        rig.handle.permit_join(30).await.unwrap();
        rig.handle.close_permit_join().await.unwrap();
        rig.handle.close_permit_join().await.unwrap();
        assert!(!rig.handle.is_permit_join_active());
        assert_eq!(
            rig.broker.published_on("bridge/bridge/request/permit_join"),
            vec![json!({"value": true, "time": 30}), json!({"value": false})]
        );
    }

    // ---- radio events ----

    #[tokio::test]
    async fn join_identifies_device_and_publishes() {
        let rig = started_rig().await;
        join_switch(&rig, ieee(1)).await;

        let device = rig.handle.device(&ieee(1)).unwrap();
        assert_eq!(device.status, DeviceStatus::Joining);
        assert_eq!(device.definition_model.as_deref(), Some("TS0001"));
        let state = rig.handle.device_state(&ieee(1));
        assert_eq!(state.len(), 2);
        assert!(state.values().all(Value::is_null));

        assert_eq!(
            rig.broker.published_on("bridge/bridge/event/device_joined"),
            vec![json!({
                "ieee_address": "aa:bb:cc:dd:ee:ff:00:01",
                "model": "TS0001",
                "manufacturer": "TuYa",
                "supported_features": ["on_off", "brightness"]
            })]
        );
    }

    #[tokio::test]
    async fn join_matches_definition_by_vendor() {
        let rig = started_rig().await;
        assert!(rig.radio.join(ieee(2), Some("TS0011"), Some("tuya")).await);
        settle(&rig.handle, |s| s.devices.contains_key(&ieee(2))).await;
        let device = rig.handle.device(&ieee(2)).unwrap();
        assert_eq!(device.model_id, "TS0011");
        assert_eq!(device.definition_model.as_deref(), Some("TS0001"));
    }

    #[tokio::test]
    async fn unidentified_join_defaults_to_unknown() {
        let rig = started_rig().await;
        assert!(rig.radio.join(ieee(3), None, None).await);
        settle(&rig.handle, |s| s.devices.contains_key(&ieee(3))).await;
        let device = rig.handle.device(&ieee(3)).unwrap();
        assert_eq!(device.model_id, "unknown");
        assert_eq!(device.manufacturer, "unknown");
        assert!(!device.is_identified());
        assert!(rig.handle.device_state(&ieee(3)).is_empty());
    }

    #[tokio::test]
    async fn announce_brings_device_online() {
        let rig = started_rig().await;
        join_switch(&rig, ieee(1)).await;
        rig.radio.announce(ieee(1)).await;
        settle(&rig.handle, |s| {
            s.device(&ieee(1)).is_some_and(|d| d.status == DeviceStatus::Online)
        })
        .await;
        assert_eq!(
            rig.broker.published_on("bridge/bridge/event/device_announce"),
            vec![json!({"ieee_address": "aa:bb:cc:dd:ee:ff:00:01"})]
        );
    }

    #[tokio::test]
    async fn events_for_unknown_devices_are_ignored() {
        let rig = started_rig().await;
        rig.radio.announce(ieee(9)).await;
        rig.radio.report(ieee(9), 6, 0, json!("ON")).await;
        rig.radio.leave(ieee(9)).await;
        // a later join proves the loop processed the earlier events
        join_switch(&rig, ieee(1)).await;
        assert_eq!(rig.handle.devices().len(), 1);
        assert!(rig.broker.published_on("bridge/bridge/event/device_leave").is_empty());
        assert!(rig.broker.published_on("bridge/aa:bb:cc:dd:ee:ff:00:09/attribute").is_empty());
    }

    #[tokio::test]
    async fn attribute_report_updates_state_and_publishes() {
        let rig = started_rig().await;
        join_switch(&rig, ieee(1)).await;
        rig.radio.report(ieee(1), 6, 0, json!("ON")).await;
        settle(&rig.handle, |s| s.state(&ieee(1))["state"] == json!("ON")).await;

        assert_eq!(
            rig.handle.device(&ieee(1)).unwrap().status,
            DeviceStatus::Online
        );
        assert_eq!(
            rig.broker.published_on("bridge/aa:bb:cc:dd:ee:ff:00:01/state"),
            vec![json!({"state": "ON"})]
        );
        assert_eq!(
            rig.broker.published_on("bridge/aa:bb:cc:dd:ee:ff:00:01/attribute"),
            vec![json!({
                "type": "attribute_update",
                "device": {
                    "ieee_address": "aa:bb:cc:dd:ee:ff:00:01",
                    "model": "TS0001",
                    "manufacturer": "TuYa"
                },
                "cluster": 6,
                "attribute": 0,
                "value": "ON"
            })]
        );
    }

    #[tokio::test]
    async fn invalid_report_keeps_state_but_publishes_raw_attribute() {
        let rig = started_rig().await;
        join_switch(&rig, ieee(1)).await;
        rig.radio.report(ieee(1), 6, 0, json!("ON")).await;
        rig.radio.report(ieee(1), 6, 0, json!("MAYBE")).await;
        rig.radio.report(ieee(1), 8, 0, json!(300)).await;
        // unmapped attribute
        rig.radio.report(ieee(1), 0x0300, 7, json!(1)).await;
        join_switch(&rig, ieee(2)).await;

        let state = rig.handle.device_state(&ieee(1));
        assert_eq!(state["state"], json!("ON"));
        assert_eq!(state["brightness"], Value::Null);
        assert_eq!(
            rig.broker.published_on("bridge/aa:bb:cc:dd:ee:ff:00:01/state").len(),
            1
        );
        assert_eq!(
            rig.broker.published_on("bridge/aa:bb:cc:dd:ee:ff:00:01/attribute").len(),
            3
        );
    }

    #[tokio::test]
    async fn leave_drops_device_and_state() {
        let rig = started_rig().await;
        join_switch(&rig, ieee(1)).await;
        rig.radio.leave(ieee(1)).await;
        settle(&rig.handle, |s| s.devices.is_empty()).await;
        assert!(rig.handle.device_state(&ieee(1)).is_empty());
        assert_eq!(
            rig.broker.published_on("bridge/bridge/event/device_leave"),
            vec![json!({"ieee_address": "aa:bb:cc:dd:ee:ff:00:01"})]
        );
    }

    // ---- device commands ----

    #[tokio::test]
    async fn update_state_validates_and_publishes() {
        let rig = started_rig().await;
        join_switch(&rig, ieee(1)).await;

        rig.handle.update_state(ieee(1), "state", json!("ON")).await.unwrap();
        let err = rig
            .handle
            .update_state(ieee(1), "state", json!("MAYBE"))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Validation { .. }));
        assert_eq!(rig.handle.device_state(&ieee(1))["state"], json!("ON"));
        assert_eq!(
            rig.broker.published_on("bridge/aa:bb:cc:dd:ee:ff:00:01/state"),
            vec![json!({"state": "ON"})]
        );

        assert_eq!(
            rig.handle.update_state(ieee(7), "state", json!("ON")).await,
            Err(BridgeError::UnknownDevice(ieee(7)))
        );
    }

    #[tokio::test]
    async fn remove_device_force_leaves_and_publishes() {
        let rig = started_rig().await;
        join_switch(&rig, ieee(1)).await;
        rig.handle.remove_device(ieee(1)).await.unwrap();

        assert!(rig.handle.device(&ieee(1)).is_none());
        assert!(rig.handle.device_state(&ieee(1)).is_empty());
        assert_eq!(rig.radio.force_left(), vec![ieee(1)]);
        assert_eq!(
            rig.broker.published_on("bridge/bridge/event/device_removed"),
            vec![json!({"ieee_address": "aa:bb:cc:dd:ee:ff:00:01"})]
        );
        assert_eq!(
            rig.handle.remove_device(ieee(1)).await,
            Err(BridgeError::UnknownDevice(ieee(1)))
        );
    }

    #[tokio::test]
    async fn failed_force_leave_keeps_device() {
        let (radio, sim) = SimRadio::builder().failing_force_leave().build();
        let rig = rig_with(radio, sim).await;
        rig.handle.start().await.unwrap();
        join_switch(&rig, ieee(1)).await;

        assert!(matches!(
            rig.handle.remove_device(ieee(1)).await,
            Err(BridgeError::Radio { .. })
        ));
        assert!(rig.handle.device(&ieee(1)).is_some());
        assert!(rig.broker.published_on("bridge/bridge/event/device_removed").is_empty());
    }

    #[tokio::test]
    async fn publishing_while_bus_down_does_not_block_state() {
        let rig = started_rig().await;
        join_switch(&rig, ieee(1)).await;
        rig.broker.drop_connection(0).await;
        rig.handle.update_state(ieee(1), "brightness", json!(42)).await.unwrap();
        assert_eq!(rig.handle.device_state(&ieee(1))["brightness"], json!(42));
    }

    // ---- isolation ----

    /// Transport that panics when asked to publish an announce event.
    struct PanickyTransport(Arc<LoopbackBroker>);

    #[async_trait]
    impl BusTransport for PanickyTransport {
        async fn open(
            &self,
            options: &meshbridge_middleware::ConnectOptions,
        ) -> Result<mpsc::Receiver<meshbridge_middleware::TransportEvent>, meshbridge_types::ConnectionError>
        {
            self.0.open(options).await
        }
        async fn subscribe(&self, filter: &str) -> Result<(), meshbridge_types::ConnectionError> {
            self.0.subscribe(filter).await
        }
        async fn publish(
            &self,
            topic: &str,
            payload: Vec<u8>,
        ) -> Result<(), meshbridge_types::ConnectionError> {
            if topic.ends_with("device_announce") {
                panic!("transport exploded");
            }
            self.0.publish(topic, payload).await
        }
        async fn stop_loop(&self) {
            self.0.stop_loop().await
        }
        async fn close(&self) {
            self.0.close().await
        }
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_the_loop() {
        let broker = Arc::new(LoopbackBroker::new());
        let gateway = Arc::new(BusGateway::new(
            Arc::new(PanickyTransport(broker.clone())),
            Topics::default(),
        ));
        gateway.connect("127.0.0.1", 1883, None, None).await.unwrap();
        let (radio, sim) = SimRadio::builder().build();
        let (handle, task) =
            NetworkController::new(Box::new(radio), RadioConfig::default(), registry(), gateway)
                .spawn(DEFAULT_COMMAND_TIMEOUT);
        handle.start().await.unwrap();

        sim.join(ieee(1), Some("TS0001"), Some("TuYa")).await;
        sim.announce(ieee(1)).await;
        sim.join(ieee(2), Some("TS0001"), Some("TuYa")).await;
        settle(&handle, |s| s.devices.contains_key(&ieee(2))).await;

        assert!(!task.is_finished());
        handle.update_state(ieee(1), "state", json!("OFF")).await.unwrap();
        assert_eq!(broker.published_on("bridge/bridge/event/device_joined").len(), 2);
    }

    /// Radio whose permit never completes.
    struct StallingRadio;

    #[async_trait]
    impl RadioStack for StallingRadio {
        async fn start(
            &mut self,
            _config: &RadioConfig,
            _events: mpsc::Sender<RadioEvent>,
        ) -> Result<(), BridgeError> {
            Ok(())
        }
        async fn stop(&mut self) -> Result<(), BridgeError> {
            Ok(())
        }
        async fn permit(&mut self, _secs: u16) -> Result<(), BridgeError> {
            std::future::pending().await
        }
        async fn devices(&self) -> Result<Vec<RadioDevice>, BridgeError> {
            Ok(Vec::new())
        }
        async fn force_leave(&mut self, _device: &DeviceId) -> Result<(), BridgeError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_command_times_out_for_caller() {
        let broker = Arc::new(LoopbackBroker::new());
        let gateway = Arc::new(BusGateway::new(broker, Topics::default()));
        let (handle, _task) = NetworkController::new(
            Box::new(StallingRadio),
            RadioConfig::default(),
            registry(),
            gateway,
        )
        .spawn(Duration::from_secs(10));
        handle.start().await.unwrap();

        let err = handle.permit_join(60).await.unwrap_err();
        assert_eq!(
            err,
            BridgeError::Timeout {
                operation: "permit_join".to_string()
            }
        );
        // readers are not blocked by the stalled command
        assert!(handle.is_started());
    }

    // ---- read-after-write ----

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reads_see_completed_writes_immediately() {
        let rig = started_rig().await;
        join_switch(&rig, ieee(1)).await;

        for i in 0..200 {
            let value = if i % 2 == 0 { "ON" } else { "OFF" };
            rig.handle.update_state(ieee(1), "state", json!(value)).await.unwrap();
            assert_eq!(rig.handle.device_state(&ieee(1))["state"], json!(value), "write {i}");
        }

        for i in 0..50 {
            rig.handle.permit_join(60).await.unwrap();
            assert!(rig.handle.is_permit_join_active(), "permit {i}");
            rig.handle.close_permit_join().await.unwrap();
            assert!(!rig.handle.is_permit_join_active(), "close {i}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn join_leave_and_remove_keep_maps_in_step() {
        let rig = started_rig().await;
        let id = ieee(9);
        let in_step = |handle: &ControllerHandle| {
            let snap = handle.snapshot();
            let devices: BTreeSet<_> = snap.devices.keys().copied().collect();
            let states: BTreeSet<_> = snap.states.keys().copied().collect();
            assert_eq!(devices, states);
        };

        for round in 0..50 {
            assert!(rig.radio.join(id, Some("TS0001"), Some("TuYa")).await);
            in_step(&rig.handle);
            let (_, _removed) = tokio::join!(
                async {
                    if round % 2 == 0 {
                        rig.radio.leave(id).await;
                    }
                },
                rig.handle.remove_device(id),
            );
            in_step(&rig.handle);
            let _ = rig.radio.join(id, None, None).await;
            let _ = rig.handle.remove_device(id).await;
            in_step(&rig.handle);
        }
    }

    #[tokio::test]
    async fn remove_with_full_event_queue_does_not_deadlock() {
        let rig = started_rig().await;
        join_switch(&rig, ieee(1)).await;
        // Fill the event channel with reports the controller has not read yet.
        let flood = async {
            for _ in 0..(EVENT_CHANNEL_SIZE * 2) {
                rig.radio.report(ieee(1), 8, 0, json!(10)).await;
            }
        };
        let (_, removed) = tokio::join!(flood, rig.handle.remove_device(ieee(1)));
        assert_eq!(removed, Ok(()));
        assert!(rig.handle.device(&ieee(1)).is_none());
    }

    #[tokio::test]
    async fn shutdown_stops_radio_and_task() {
        let rig = started_rig().await;
        rig.handle.shutdown().await.unwrap();
        assert!(!rig.radio.is_started());
        assert_eq!(
            rig.handle.start().await,
            Err(BridgeError::ControllerUnavailable)
        );
    }
}
