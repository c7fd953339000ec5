//! `meshbridge-types` – shared vocabulary of the bridge.
//!
//! Every crate in the workspace speaks in terms of the types defined here:
//! the mesh address of a device ([`DeviceId`]), its lifecycle
//! ([`DeviceStatus`]), its per-property state ([`StateMap`]) and the global
//! error taxonomy ([`BridgeError`]).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Current value of every exposed property of one device, keyed by property
/// name.  A property that has never been reported holds `null`.
pub type StateMap = BTreeMap<String, serde_json::Value>;

// ─────────────────────────────────────────────────────────────────────────────
// DeviceId
// ─────────────────────────────────────────────────────────────────────────────

/// IEEE EUI-64 mesh address, the stable identity of a device.
///
/// Parsed from eight colon-separated hex octets (`"AA:BB:CC:DD:EE:FF:00:11"`),
/// case-insensitively.  Always rendered in lowercase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId([u8; 8]);

impl DeviceId {
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, octet) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{octet:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for DeviceId {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BridgeError::InvalidDeviceId(s.to_string());
        let mut bytes = [0u8; 8];
        let mut parts = s.trim().split(':');
        for slot in &mut bytes {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *slot = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(bytes))
    }
}

impl Serialize for DeviceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Device
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle of a device inside the bridge.
///
/// `Joining → Online → (Leaving | Removed)`.  The two terminal states are
/// only ever observed on the record handed back when a device is dropped from
/// the device map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Joining,
    Online,
    Leaving,
    Removed,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeviceStatus::Joining => "joining",
            DeviceStatus::Online => "online",
            DeviceStatus::Leaving => "leaving",
            DeviceStatus::Removed => "removed",
        };
        f.write_str(label)
    }
}

/// A device currently known to the network controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub model_id: String,
    pub manufacturer: String,
    /// Model id of the capability definition this device was identified
    /// with.  May differ from `model_id` when the definition was matched by
    /// vendor.
    pub definition_model: Option<String>,
    /// Feature tags advertised by the matched definition.
    pub supported_features: Vec<String>,
    pub status: DeviceStatus,
    pub last_seen: DateTime<Utc>,
    pub joined_at: DateTime<Utc>,
}

impl Device {
    /// `true` once the device has been matched to a capability definition.
    pub fn is_identified(&self) -> bool {
        self.definition_model.is_some()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Failures talking to the message-bus broker.
///
/// Each variant is reported as-is to the caller; there is no automatic
/// reconnect.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("failed to resolve broker hostname {host}: {reason}")]
    Resolution { host: String, reason: String },

    #[error("connection timeout after {secs} seconds")]
    Timeout { secs: u64 },

    #[error("broker rejected connection (code {code}): {reason}")]
    Rejected { code: u8, reason: String },

    #[error("bus transport error: {0}")]
    Transport(String),
}

/// Global error type of the bridge.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Configuration Error: {0}")]
    Configuration(String),

    #[error("Connection Error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Radio Stack Error during {operation}: {details}")]
    Radio { operation: String, details: String },

    #[error("Validation Error: value {value} rejected for {state} on {device}")]
    Validation {
        device: DeviceId,
        state: String,
        value: String,
    },

    #[error("Unknown device: {0}")]
    UnknownDevice(DeviceId),

    #[error("Invalid device id: {0:?}")]
    InvalidDeviceId(String),

    #[error("Radio network is not started")]
    NotStarted,

    #[error("Timed out waiting for {operation}")]
    Timeout { operation: String },

    #[error("Network controller is not running")]
    ControllerUnavailable,

    #[error("Serialization Error: {0}")]
    Serialization(String),
}

impl BridgeError {
    /// Shorthand for a [`BridgeError::Radio`] raised by `operation`.
    pub fn radio(operation: impl Into<String>, details: impl fmt::Display) -> Self {
        BridgeError::Radio {
            operation: operation.into(),
            details: details.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_parses_case_insensitively() {
        let upper: DeviceId = "AA:BB:CC:DD:EE:FF:00:11".parse().unwrap();
        let lower: DeviceId = "aa:bb:cc:dd:ee:ff:00:11".parse().unwrap();
        assert_eq!(upper, lower);
        assert_eq!(upper.to_string(), "aa:bb:cc:dd:ee:ff:00:11");
    }

    #[test]
    fn device_id_rejects_malformed_addresses() {
        for raw in [
            "",
            "aa:bb:cc",
            "aa:bb:cc:dd:ee:ff:00:11:22",
            "aa:bb:cc:dd:ee:ff:00:1",
            "zz:bb:cc:dd:ee:ff:00:11",
            "aabbccddeeff0011",
        ] {
            assert!(
                matches!(raw.parse::<DeviceId>(), Err(BridgeError::InvalidDeviceId(_))),
                "{raw:?} must be rejected"
            );
        }
    }

    #[test]
    fn device_id_serializes_as_string() {
        let id: DeviceId = "00:11:22:33:44:55:66:77".parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"00:11:22:33:44:55:66:77\"");
        let back: DeviceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn connection_error_converts_into_bridge_error() {
        let err: BridgeError = ConnectionError::Timeout { secs: 5 }.into();
        assert!(err.to_string().contains("timeout after 5 seconds"));
    }

    #[test]
    fn validation_error_display_names_device_and_state() {
        let device: DeviceId = "aa:bb:cc:dd:ee:ff:00:11".parse().unwrap();
        let err = BridgeError::Validation {
            device,
            state: "state".into(),
            value: "\"MAYBE\"".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("aa:bb:cc:dd:ee:ff:00:11"));
        assert!(msg.contains("MAYBE"));
    }

    #[test]
    fn radio_helper_builds_radio_variant() {
        let err = BridgeError::radio("permit", "serial port closed");
        assert_eq!(
            err,
            BridgeError::Radio {
                operation: "permit".into(),
                details: "serial port closed".into()
            }
        );
    }
}
