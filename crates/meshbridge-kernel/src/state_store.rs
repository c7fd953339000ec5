//! [`StateStore`] – validated per-device state.
//!
//! Every write is checked against the capability definition the device was
//! identified with before it is stored; a rejected write leaves the previous
//! state untouched.  The store is owned by the network controller and never
//! shared mutably.

use std::collections::HashMap;
use std::sync::Arc;

use meshbridge_types::{BridgeError, DeviceId, StateMap};
use serde_json::Value;
use tracing::debug;

use crate::capability_registry::CapabilityRegistry;

struct DeviceState {
    /// Model id used for validation.
    model_id: String,
    values: StateMap,
}

/// Per-device state maps keyed by [`DeviceId`].
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use meshbridge_kernel::{CapabilityRegistry, StateStore};
/// use meshbridge_kernel::definition::CapabilityDefinition;
/// use serde_json::json;
///
/// let mut registry = CapabilityRegistry::new();
/// registry.insert(CapabilityDefinition::from_json(r#"{
///     "model_id": "TS0001",
///     "exposes": [{"type": "binary", "name": "state", "values": ["ON", "OFF"]}]
/// }"#).unwrap());
///
/// let mut store = StateStore::new(Arc::new(registry));
/// let id = "00:11:22:33:44:55:66:77".parse().unwrap();
/// store.insert(id, "TS0001", ["state"]);
///
/// assert!(store.update(&id, "state", json!("ON")).is_ok());
/// assert!(store.update(&id, "state", json!("MAYBE")).is_err());
/// assert_eq!(store.get(&id)["state"], json!("ON"));
/// ```
pub struct StateStore {
    registry: Arc<CapabilityRegistry>,
    devices: HashMap<DeviceId, DeviceState>,
}

impl StateStore {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self {
            registry,
            devices: HashMap::new(),
        }
    }

    /// Create (or replace) the state map of `id`, with every name in `names`
    /// mapped to `null`.  `model_id` is the model the values are validated
    /// against.
    pub fn insert<'a>(
        &mut self,
        id: DeviceId,
        model_id: &str,
        names: impl IntoIterator<Item = &'a str>,
    ) {
        let values = names
            .into_iter()
            .map(|name| (name.to_string(), Value::Null))
            .collect();
        self.devices.insert(
            id,
            DeviceState {
                model_id: model_id.to_string(),
                values,
            },
        );
    }

    /// Validate and store `value` for property `state` of device `id`.
    pub fn update(&mut self, id: &DeviceId, state: &str, value: Value) -> Result<(), BridgeError> {
        let entry = self
            .devices
            .get_mut(id)
            .ok_or(BridgeError::UnknownDevice(*id))?;

        if !self.registry.validate(&entry.model_id, state, &value) {
            return Err(BridgeError::Validation {
                device: *id,
                state: state.to_string(),
                value: value.to_string(),
            });
        }

        debug!(device = %id, state, value = %value, "state updated");
        entry.values.insert(state.to_string(), value);
        Ok(())
    }

    /// Copy of the state map of `id`; empty when the device is unknown.
    pub fn get(&self, id: &DeviceId) -> StateMap {
        self.devices
            .get(id)
            .map(|s| s.values.clone())
            .unwrap_or_default()
    }

    /// Drop the state map of `id`.  Removing an unknown device is a no-op.
    pub fn remove(&mut self, id: &DeviceId) {
        self.devices.remove(id);
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.devices.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Copies of every state map, for publishing a read snapshot.
    pub fn snapshot(&self) -> HashMap<DeviceId, StateMap> {
        self.devices
            .iter()
            .map(|(id, s)| (*id, s.values.clone()))
            .collect()
    }
}
