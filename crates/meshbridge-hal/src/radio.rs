//! The radio collaborator surface.
//!
//! A [`RadioStack`] wraps whatever actually drives the mesh coordinator
//! (serial framing, network formation, the pairing database).  The bridge
//! only issues the handful of commands below and consumes [`RadioEvent`]s.
//!
//! | Command | Effect |
//! |---|---|
//! | `start` | open the coordinator, form the network if needed, begin emitting events |
//! | `stop` | release the coordinator |
//! | `permit(secs)` | open the join window for `secs` seconds, `0` closes it |
//! | `devices` | enumerate devices already paired with the coordinator |
//! | `force_leave` | ask a device to leave the network |

use async_trait::async_trait;
use meshbridge_types::{BridgeError, DeviceId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Lowest and highest 2.4 GHz channel a coordinator may form on.
pub const MIN_CHANNEL: u8 = 11;
pub const MAX_CHANNEL: u8 = 26;

/// Radio network parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RadioConfig {
    /// Serial device of the coordinator, e.g. `/dev/ttyUSB0`.
    pub serial_port: String,
    pub channel: u8,
    pub pan_id: u16,
    /// Form a new network when the coordinator has none.
    pub auto_form: bool,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            serial_port: "/dev/ttyUSB0".to_string(),
            channel: 11,
            pan_id: 0x1a62,
            auto_form: true,
        }
    }
}

impl RadioConfig {
    /// Check the parameters before anything touches the coordinator.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.serial_port.trim().is_empty() {
            return Err(BridgeError::Configuration(
                "radio serial port must not be empty".to_string(),
            ));
        }
        if !(MIN_CHANNEL..=MAX_CHANNEL).contains(&self.channel) {
            return Err(BridgeError::Configuration(format!(
                "radio channel must be {MIN_CHANNEL}-{MAX_CHANNEL}, got {}",
                self.channel
            )));
        }
        Ok(())
    }
}

/// Parse a PAN id written as hex, with or without a `0x` prefix.
pub fn parse_pan_id(raw: &str) -> Result<u16, BridgeError> {
    let trimmed = raw.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u16::from_str_radix(digits, 16)
        .map_err(|_| BridgeError::Configuration(format!("invalid PAN id {raw:?}")))
}

/// A device as known to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioDevice {
    pub ieee: DeviceId,
    /// Model identifier read from the basic cluster, if the interview got that far.
    pub model: Option<String>,
    pub manufacturer: Option<String>,
    /// Short network address.
    pub nwk: u16,
}

/// Something the mesh network did.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    DeviceJoined(RadioDevice),
    DeviceLeft {
        ieee: DeviceId,
    },
    DeviceAnnounce {
        ieee: DeviceId,
    },
    AttributeReport {
        ieee: DeviceId,
        cluster: u16,
        attribute: u16,
        value: Value,
    },
}

impl RadioEvent {
    /// Device the event concerns.
    pub fn device(&self) -> DeviceId {
        match self {
            RadioEvent::DeviceJoined(dev) => dev.ieee,
            RadioEvent::DeviceLeft { ieee }
            | RadioEvent::DeviceAnnounce { ieee }
            | RadioEvent::AttributeReport { ieee, .. } => *ieee,
        }
    }
}

/// Driver of a mesh coordinator.
///
/// Implementations push events into the sender handed to
/// [`start`](RadioStack::start) until [`stop`](RadioStack::stop) is called.
#[async_trait]
pub trait RadioStack: Send + Sync {
    async fn start(
        &mut self,
        config: &RadioConfig,
        events: mpsc::Sender<RadioEvent>,
    ) -> Result<(), BridgeError>;

    async fn stop(&mut self) -> Result<(), BridgeError>;

    /// Open the join window for `secs` seconds; `0` closes it.
    async fn permit(&mut self, secs: u16) -> Result<(), BridgeError>;

    /// Devices already paired with the coordinator.
    async fn devices(&self) -> Result<Vec<RadioDevice>, BridgeError>;

    async fn force_leave(&mut self, device: &DeviceId) -> Result<(), BridgeError>;
}
