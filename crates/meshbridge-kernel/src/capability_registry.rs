//! [`CapabilityRegistry`] – the catalogue of known device models.
//!
//! Definitions are loaded once from a directory of JSON files (see
//! [`crate::definition`]) and are immutable afterwards; the registry is shared
//! behind an `Arc` between the network controller and the state store.
//!
//! | Operation | Behaviour |
//! |-----------|-----------|
//! | [`load`](CapabilityRegistry::load) | best effort; unreadable or invalid files are skipped with a warning |
//! | [`identify`](CapabilityRegistry::identify) | exact model id first, then first definition whose vendor matches |
//! | [`validate`](CapabilityRegistry::validate) | `false` for unknown model, unknown property or rejected value |

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::definition::CapabilityDefinition;

/// In-memory catalogue of [`CapabilityDefinition`]s keyed by model id.
///
/// # Example
///
/// ```
/// use meshbridge_kernel::capability_registry::CapabilityRegistry;
/// use meshbridge_kernel::definition::CapabilityDefinition;
/// use serde_json::json;
///
/// let mut registry = CapabilityRegistry::new();
/// registry.insert(CapabilityDefinition::from_json(r#"{
///     "model_id": "TS0001", "vendor": "TuYa",
///     "exposes": [{"type": "binary", "name": "state", "values": ["ON", "OFF"]}]
/// }"#).unwrap());
///
/// assert!(registry.validate("TS0001", "state", &json!("ON")));
/// assert!(!registry.validate("TS0001", "state", &json!("MAYBE")));
/// ```
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    /// Definitions in load order; the vendor fallback walks this order.
    definitions: Vec<Arc<CapabilityDefinition>>,
    by_model: HashMap<String, usize>,
}

impl CapabilityRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.json` file in `dir`, in file-name order.
    ///
    /// A missing directory yields an empty registry.  Files that cannot be
    /// read or parsed are skipped.  When two files declare the same model id
    /// the later one wins.
    pub fn load(dir: &Path) -> Self {
        let mut registry = Self::new();

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "definitions directory unavailable");
                return registry;
            }
        };

        let mut paths: Vec<_> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        for path in paths {
            let raw = match fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "definition file unreadable");
                    continue;
                }
            };
            match CapabilityDefinition::from_json(&raw) {
                Ok(def) => {
                    debug!(file = %path.display(), model_id = %def.model_id, "definition loaded");
                    registry.insert(def);
                }
                Err(e) => warn!(file = %path.display(), error = %e, "definition file skipped"),
            }
        }

        info!(dir = %dir.display(), count = registry.len(), "capability definitions loaded");
        registry
    }

    /// Register `def`, replacing any definition with the same model id.
    pub fn insert(&mut self, def: CapabilityDefinition) {
        let def = Arc::new(def);
        match self.by_model.get(&def.model_id) {
            Some(&idx) => {
                warn!(model_id = %def.model_id, "duplicate definition replaces earlier one");
                self.definitions[idx] = def;
            }
            None => {
                self.by_model.insert(def.model_id.clone(), self.definitions.len());
                self.definitions.push(def);
            }
        }
    }

    /// Definition registered for exactly `model_id`.
    pub fn definition(&self, model_id: &str) -> Option<Arc<CapabilityDefinition>> {
        self.by_model
            .get(model_id)
            .map(|&idx| Arc::clone(&self.definitions[idx]))
    }

    /// Resolve the definition for a device reporting `model_id` and,
    /// optionally, `manufacturer`.
    ///
    /// An exact model match wins.  Otherwise the first loaded definition whose
    /// vendor equals the manufacturer (ignoring ASCII case) is used.
    pub fn identify(
        &self,
        model_id: &str,
        manufacturer: Option<&str>,
    ) -> Option<Arc<CapabilityDefinition>> {
        if let Some(def) = self.definition(model_id) {
            return Some(def);
        }
        let vendor = manufacturer.map(str::trim).filter(|m| !m.is_empty())?;
        self.definitions
            .iter()
            .find(|d| d.vendor.eq_ignore_ascii_case(vendor))
            .cloned()
    }

    /// `true` when `value` is acceptable for property `state` of `model_id`.
    pub fn validate(&self, model_id: &str, state: &str, value: &Value) -> bool {
        self.definition(model_id)
            .and_then(|def| def.exposed(state).map(|p| p.kind.accepts(value)))
            .unwrap_or(false)
    }

    /// Number of distinct model ids registered.
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// All definitions, in load order.
    pub fn definitions(&self) -> impl Iterator<Item = &CapabilityDefinition> {
        self.definitions.iter().map(Arc::as_ref)
    }
}
