//! Topic layout and JSON payloads of the bridge.
//!
//! | Topic | Direction | Payload |
//! |---|---|---|
//! | `<base>/bridge/event/device_joined` | out | `{ieee_address, model, manufacturer, supported_features}` |
//! | `<base>/bridge/event/device_leave` | out | `{ieee_address}` |
//! | `<base>/bridge/event/device_announce` | out | `{ieee_address}` |
//! | `<base>/bridge/event/device_removed` | out | `{ieee_address}` |
//! | `<base>/<ieee>/state` | out | `{name: value}` |
//! | `<base>/<ieee>/attribute` | out | `{type: "attribute_update", device, cluster, attribute, value}` |
//! | `<base>/bridge/request/permit_join` | out | `{value, time?}` |
//! | `<base>/<ieee>/set` | in | `{name: value, ...}` |
//! | `<base>/bridge/command/permit_join` | in | `{value, time?}` |
//! | `<base>/bridge/command/remove` | in | `{ieee_address}` |

use meshbridge_types::{BridgeError, Device, DeviceId};
use serde::Deserialize;
use serde_json::{Map, Value, json};

/// Base topic used when none is configured.
pub const DEFAULT_BASE_TOPIC: &str = "bridge";

/// Bridge lifecycle events published under `<base>/bridge/event/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeEvent {
    DeviceJoined,
    DeviceLeave,
    DeviceAnnounce,
    DeviceRemoved,
}

impl BridgeEvent {
    fn as_str(self) -> &'static str {
        match self {
            BridgeEvent::DeviceJoined => "device_joined",
            BridgeEvent::DeviceLeave => "device_leave",
            BridgeEvent::DeviceAnnounce => "device_announce",
            BridgeEvent::DeviceRemoved => "device_removed",
        }
    }
}

/// Topic builder bound to one base topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    base: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_TOPIC)
    }
}

impl Topics {
    /// Trailing slashes are stripped; an empty base falls back to the default.
    pub fn new(base: &str) -> Self {
        let base = base.trim().trim_end_matches('/');
        let base = if base.is_empty() { DEFAULT_BASE_TOPIC } else { base };
        Self {
            base: base.to_string(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn event(&self, event: BridgeEvent) -> String {
        format!("{}/bridge/event/{}", self.base, event.as_str())
    }

    pub fn state(&self, id: &DeviceId) -> String {
        format!("{}/{id}/state", self.base)
    }

    pub fn attribute(&self, id: &DeviceId) -> String {
        format!("{}/{id}/attribute", self.base)
    }

    pub fn permit_join(&self) -> String {
        format!("{}/bridge/request/permit_join", self.base)
    }

    /// Filters the gateway subscribes to once connected.
    pub fn command_filters(&self) -> [String; 2] {
        [
            format!("{}/+/set", self.base),
            format!("{}/bridge/command/#", self.base),
        ]
    }

    /// Interpret an inbound message.  `Ok(None)` means the topic is not a
    /// command topic of this bridge.
    pub fn parse_command(
        &self,
        topic: &str,
        payload: &Value,
    ) -> Result<Option<InboundCommand>, BridgeError> {
        let Some(rest) = topic
            .strip_prefix(self.base.as_str())
            .and_then(|r| r.strip_prefix('/'))
        else {
            return Ok(None);
        };

        match rest {
            "bridge/command/permit_join" => {
                let cmd: PermitJoinCommand = serde_json::from_value(payload.clone())
                    .map_err(|e| BridgeError::Serialization(format!("permit_join: {e}")))?;
                Ok(Some(InboundCommand::PermitJoin {
                    value: cmd.value,
                    time: cmd.time,
                }))
            }
            "bridge/command/remove" => {
                let cmd: RemoveCommand = serde_json::from_value(payload.clone())
                    .map_err(|e| BridgeError::Serialization(format!("remove: {e}")))?;
                Ok(Some(InboundCommand::Remove {
                    id: cmd.ieee_address.parse()?,
                }))
            }
            other => {
                let Some(device) = other.strip_suffix("/set") else {
                    return Ok(None);
                };
                if device.contains('/') {
                    return Ok(None);
                }
                let id: DeviceId = device.parse()?;
                let Value::Object(values) = payload else {
                    return Err(BridgeError::Serialization(format!(
                        "set for {id}: expected a JSON object"
                    )));
                };
                Ok(Some(InboundCommand::SetState {
                    id,
                    values: values.clone(),
                }))
            }
        }
    }
}

/// A command received from the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundCommand {
    SetState { id: DeviceId, values: Map<String, Value> },
    PermitJoin { value: bool, time: Option<u16> },
    Remove { id: DeviceId },
}

#[derive(Deserialize)]
struct PermitJoinCommand {
    value: bool,
    time: Option<u16>,
}

#[derive(Deserialize)]
struct RemoveCommand {
    ieee_address: String,
}

/// MQTT-style filter match supporting `+` (one level) and a trailing `#`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut levels = topic.split('/');
    for part in filter.split('/') {
        match part {
            "#" => return true,
            "+" => {
                if levels.next().is_none() {
                    return false;
                }
            }
            literal => {
                if levels.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    levels.next().is_none()
}

// ─────────────────────────────────────────────────────────────────────────────
// Payloads
// ─────────────────────────────────────────────────────────────────────────────

pub fn device_joined_payload(device: &Device) -> Value {
    json!({
        "ieee_address": device.id,
        "model": device.model_id,
        "manufacturer": device.manufacturer,
        "supported_features": device.supported_features,
    })
}

/// Payload of the leave, announce and removed events.
pub fn device_ref_payload(id: &DeviceId) -> Value {
    json!({ "ieee_address": id })
}

pub fn state_payload(state: &str, value: &Value) -> Value {
    let mut map = Map::new();
    map.insert(state.to_string(), value.clone());
    Value::Object(map)
}

pub fn attribute_payload(device: &Device, cluster: u16, attribute: u16, value: &Value) -> Value {
    json!({
        "type": "attribute_update",
        "device": {
            "ieee_address": device.id,
            "model": device.model_id,
            "manufacturer": device.manufacturer,
        },
        "cluster": cluster,
        "attribute": attribute,
        "value": value,
    })
}

pub fn permit_join_payload(open: Option<u16>) -> Value {
    match open {
        Some(secs) => json!({ "value": true, "time": secs }),
        None => json!({ "value": false }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> DeviceId {
        "aa:bb:cc:dd:ee:ff:00:11".parse().unwrap()
    }

    #[test]
    fn topic_layout() {
        let t = Topics::new("home/zb/");
        assert_eq!(t.base(), "home/zb");
        assert_eq!(
            t.event(BridgeEvent::DeviceJoined),
            "home/zb/bridge/event/device_joined"
        );
        assert_eq!(t.state(&id()), "home/zb/aa:bb:cc:dd:ee:ff:00:11/state");
        assert_eq!(t.attribute(&id()), "home/zb/aa:bb:cc:dd:ee:ff:00:11/attribute");
        assert_eq!(t.permit_join(), "home/zb/bridge/request/permit_join");
        assert_eq!(Topics::new("  ").base(), DEFAULT_BASE_TOPIC);
    }

    #[test]
    fn wildcard_matching() {
        assert!(topic_matches("bridge/+/set", "bridge/aa:bb/set"));
        assert!(!topic_matches("bridge/+/set", "bridge/aa/bb/set"));
        assert!(topic_matches("bridge/bridge/command/#", "bridge/bridge/command/remove"));
        assert!(topic_matches("bridge/#", "bridge"));
        assert!(!topic_matches("bridge/+/set", "bridge/aa/state"));
        assert!(!topic_matches("bridge/x", "bridge/x/y"));
    }

    #[test]
    fn parses_set_command() {
        let t = Topics::default();
        let cmd = t
            .parse_command(
                "bridge/AA:BB:CC:DD:EE:FF:00:11/set",
                &json!({"state": "ON", "brightness": 10}),
            )
            .unwrap()
            .unwrap();
        match cmd {
            InboundCommand::SetState { id: dev, values } => {
                assert_eq!(dev, id());
                assert_eq!(values.len(), 2);
                assert_eq!(values["state"], json!("ON"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn set_command_requires_object() {
        let t = Topics::default();
        let res = t.parse_command("bridge/aa:bb:cc:dd:ee:ff:00:11/set", &json!("ON"));
        assert!(matches!(res, Err(BridgeError::Serialization(_))));
    }

    #[test]
    fn parses_bridge_commands() {
        let t = Topics::default();
        assert_eq!(
            t.parse_command("bridge/bridge/command/permit_join", &json!({"value": true, "time": 30}))
                .unwrap(),
            Some(InboundCommand::PermitJoin { value: true, time: Some(30) })
        );
        assert_eq!(
            t.parse_command("bridge/bridge/command/permit_join", &json!({"value": false}))
                .unwrap(),
            Some(InboundCommand::PermitJoin { value: false, time: None })
        );
        assert_eq!(
            t.parse_command(
                "bridge/bridge/command/remove",
                &json!({"ieee_address": "aa:bb:cc:dd:ee:ff:00:11"})
            )
            .unwrap(),
            Some(InboundCommand::Remove { id: id() })
        );
    }

    #[test]
    fn malformed_commands_are_errors() {
        let t = Topics::default();
        assert!(t
            .parse_command("bridge/bridge/command/permit_join", &json!({"time": 30}))
            .is_err());
        assert!(matches!(
            t.parse_command("bridge/bridge/command/remove", &json!({"ieee_address": "nope"})),
            Err(BridgeError::InvalidDeviceId(_))
        ));
        assert!(matches!(
            t.parse_command("bridge/not-an-id/set", &json!({})),
            Err(BridgeError::InvalidDeviceId(_))
        ));
    }

    #[test]
    fn foreign_topics_are_ignored() {
        let t = Topics::default();
        assert_eq!(t.parse_command("other/x/set", &json!({})).unwrap(), None);
        assert_eq!(t.parse_command("bridge/bridge/command/restart", &json!({})).unwrap(), None);
        assert_eq!(
            t.parse_command("bridge/aa:bb:cc:dd:ee:ff:00:11/state", &json!({})).unwrap(),
            None
        );
    }

    #[test]
    fn permit_join_payloads() {
        assert_eq!(permit_join_payload(Some(60)), json!({"value": true, "time": 60}));
        assert_eq!(permit_join_payload(None), json!({"value": false}));
    }

    #[test]
    fn state_payload_is_single_entry() {
        assert_eq!(state_payload("state", &json!("ON")), json!({"state": "ON"}));
    }
}
