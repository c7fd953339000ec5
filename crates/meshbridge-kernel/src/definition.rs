//! Capability definitions – what a device model exposes and which values
//! each exposed property accepts.
//!
//! Definitions are read from JSON documents of the form:
//!
//! ```json
//! {
//!   "model_id": "TS0001",
//!   "vendor": "TuYa",
//!   "description": "Smart switch",
//!   "supports": ["on_off"],
//!   "exposes": [
//!     { "type": "binary", "name": "state", "property": "state", "access": 7,
//!       "values": ["ON", "OFF"], "cluster": 6, "attribute": 0 }
//!   ]
//! }
//! ```
//!
//! The free-form `exposes` entries are converted into the closed
//! [`PropertyKind`] when the document is parsed, so run-time validation never
//! inspects arbitrary JSON.  Entries of any other `type` are skipped.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Why a definition document could not be used at all.
#[derive(Error, Debug)]
pub enum DefinitionError {
    #[error("malformed definition: {0}")]
    Json(#[from] serde_json::Error),

    #[error("definition has no model_id")]
    MissingModelId,
}

/// Value constraint of an [`ExposedProperty`].
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyKind {
    /// Only the listed literal values are accepted (exact JSON equality).
    Binary { values: Vec<Value> },
    /// Any finite number inside the inclusive bounds that are present.
    Numeric { min: Option<f64>, max: Option<f64> },
}

impl PropertyKind {
    /// `true` when `value` satisfies this constraint.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            PropertyKind::Binary { values } => values.contains(value),
            PropertyKind::Numeric { min, max } => match numeric_value(value) {
                Some(v) => min.is_none_or(|lo| v >= lo) && max.is_none_or(|hi| v <= hi),
                None => false,
            },
        }
    }
}

/// Numbers are accepted as JSON numbers or as strings holding a number.
fn numeric_value(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

/// One controllable or observable state dimension of a device.
#[derive(Debug, Clone, PartialEq)]
pub struct ExposedProperty {
    pub name: String,
    /// Key used on the wire; defaults to `name`.
    pub property: String,
    /// Access bitmask (1 = published, 2 = settable, 4 = gettable).
    pub access: u8,
    /// Radio cluster carrying this property, when mapped.
    pub cluster: Option<u16>,
    /// Attribute id inside `cluster`, when mapped.
    pub attribute: Option<u16>,
    pub kind: PropertyKind,
}

impl ExposedProperty {
    /// `true` when this property is carried by `cluster`/`attribute`.
    pub fn maps(&self, cluster: u16, attribute: u16) -> bool {
        self.cluster == Some(cluster) && self.attribute == Some(attribute)
    }
}

/// Declarative description of one device model.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityDefinition {
    pub model_id: String,
    pub vendor: String,
    pub description: String,
    pub supports: Vec<String>,
    pub exposes: Vec<ExposedProperty>,
}

impl CapabilityDefinition {
    /// Parse and fully validate a definition document.
    pub fn from_json(raw: &str) -> Result<Self, DefinitionError> {
        let doc: RawDefinition = serde_json::from_str(raw)?;
        let model_id = doc
            .model_id
            .filter(|m| !m.trim().is_empty())
            .ok_or(DefinitionError::MissingModelId)?;

        let mut exposes: Vec<ExposedProperty> = Vec::with_capacity(doc.exposes.len());
        for raw in doc.exposes {
            let name = raw.name.clone();
            match raw.into_property() {
                Ok(prop) if exposes.iter().any(|p| p.name == prop.name) => {
                    warn!(model_id = %model_id, property = %name, "duplicate exposed property ignored");
                }
                Ok(prop) => exposes.push(prop),
                Err(reason) => {
                    warn!(model_id = %model_id, property = %name, %reason, "exposed property skipped");
                }
            }
        }

        Ok(Self {
            model_id,
            vendor: doc.vendor,
            description: doc.description,
            supports: doc.supports,
            exposes,
        })
    }

    /// Look up an exposed property by name.
    pub fn exposed(&self, name: &str) -> Option<&ExposedProperty> {
        self.exposes.iter().find(|p| p.name == name)
    }

    /// Find the property reported on `cluster`/`attribute` (linear scan).
    pub fn property_for(&self, cluster: u16, attribute: u16) -> Option<&ExposedProperty> {
        self.exposes.iter().find(|p| p.maps(cluster, attribute))
    }

    /// Names of every exposed property, in declaration order.
    pub fn state_names(&self) -> impl Iterator<Item = &str> {
        self.exposes.iter().map(|p| p.name.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire format
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RawDefinition {
    model_id: Option<String>,
    #[serde(default)]
    vendor: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    supports: Vec<String>,
    #[serde(default)]
    exposes: Vec<RawExpose>,
}

#[derive(Deserialize)]
struct RawExpose {
    #[serde(rename = "type")]
    kind: String,
    name: String,
    property: Option<String>,
    #[serde(default)]
    access: u8,
    values: Option<Vec<Value>>,
    value_min: Option<f64>,
    value_max: Option<f64>,
    cluster: Option<u16>,
    attribute: Option<u16>,
}

impl RawExpose {
    fn into_property(self) -> Result<ExposedProperty, String> {
        let kind = match self.kind.as_str() {
            "binary" => match self.values {
                Some(values) if !values.is_empty() => PropertyKind::Binary { values },
                _ => return Err("binary property without allowed values".to_string()),
            },
            "numeric" => {
                if let (Some(lo), Some(hi)) = (self.value_min, self.value_max)
                    && lo > hi
                {
                    return Err(format!("value_min {lo} exceeds value_max {hi}"));
                }
                PropertyKind::Numeric {
                    min: self.value_min,
                    max: self.value_max,
                }
            }
            other => return Err(format!("unsupported property type {other:?}")),
        };

        Ok(ExposedProperty {
            property: self.property.unwrap_or_else(|| self.name.clone()),
            name: self.name,
            access: self.access,
            cluster: self.cluster,
            attribute: self.attribute,
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SWITCH: &str = r#"{
        "model_id": "TS0001",
        "vendor": "TuYa",
        "description": "Smart switch",
        "supports": ["on_off", "brightness"],
        "exposes": [
            {"type": "binary", "name": "state", "property": "state", "access": 7,
             "values": ["ON", "OFF"], "cluster": 6, "attribute": 0},
            {"type": "numeric", "name": "brightness", "property": "brightness", "access": 7,
             "value_min": 0, "value_max": 254, "cluster": 8, "attribute": 0}
        ]
    }"#;

    #[test]
    fn parses_switch_definition() {
        let def = CapabilityDefinition::from_json(SWITCH).unwrap();
        assert_eq!(def.model_id, "TS0001");
        assert_eq!(def.vendor, "TuYa");
        assert_eq!(def.supports, vec!["on_off", "brightness"]);
        assert_eq!(def.state_names().collect::<Vec<_>>(), vec!["state", "brightness"]);
        assert_eq!(def.property_for(8, 0).map(|p| p.name.as_str()), Some("brightness"));
        assert!(def.property_for(6, 1).is_none());
    }

    #[test]
    fn binary_accepts_only_listed_literals() {
        let kind = PropertyKind::Binary {
            values: vec![json!("ON"), json!("OFF")],
        };
        assert!(kind.accepts(&json!("ON")));
        assert!(kind.accepts(&json!("OFF")));
        assert!(!kind.accepts(&json!("on")));
        assert!(!kind.accepts(&json!("MAYBE")));
        assert!(!kind.accepts(&json!(true)));
        assert!(!kind.accepts(&Value::Null));
    }

    #[test]
    fn numeric_bounds_are_inclusive() {
        let kind = PropertyKind::Numeric {
            min: Some(0.0),
            max: Some(254.0),
        };
        assert!(kind.accepts(&json!(0)));
        assert!(kind.accepts(&json!(254)));
        assert!(kind.accepts(&json!(127.5)));
        assert!(!kind.accepts(&json!(-1)));
        assert!(!kind.accepts(&json!(254.01)));
    }

    #[test]
    fn numeric_open_bound_is_unbounded() {
        let only_min = PropertyKind::Numeric { min: Some(10.0), max: None };
        assert!(only_min.accepts(&json!(1_000_000)));
        assert!(!only_min.accepts(&json!(9)));

        let unbounded = PropertyKind::Numeric { min: None, max: None };
        assert!(unbounded.accepts(&json!(-1e9)));
    }

    #[test]
    fn numeric_accepts_numeric_strings_only() {
        let kind = PropertyKind::Numeric { min: None, max: None };
        assert!(kind.accepts(&json!("42")));
        assert!(kind.accepts(&json!(" 3.5 ")));
        assert!(!kind.accepts(&json!("forty-two")));
        assert!(!kind.accepts(&json!("NaN")));
        assert!(!kind.accepts(&json!("inf")));
        assert!(!kind.accepts(&json!(true)));
        assert!(!kind.accepts(&Value::Null));
    }

    #[test]
    fn unsupported_and_invalid_properties_are_skipped() {
        let raw = r#"{
            "model_id": "X1",
            "exposes": [
                {"type": "enum", "name": "mode", "values": ["a", "b"]},
                {"type": "binary", "name": "empty", "values": []},
                {"type": "numeric", "name": "inverted", "value_min": 10, "value_max": 1},
                {"type": "numeric", "name": "temperature"}
            ]
        }"#;
        let def = CapabilityDefinition::from_json(raw).unwrap();
        assert_eq!(def.state_names().collect::<Vec<_>>(), vec!["temperature"]);
        assert_eq!(def.exposed("temperature").map(|p| p.property.as_str()), Some("temperature"));
    }

    #[test]
    fn duplicate_property_names_keep_first() {
        let raw = r#"{
            "model_id": "X2",
            "exposes": [
                {"type": "binary", "name": "state", "values": ["ON", "OFF"]},
                {"type": "numeric", "name": "state"}
            ]
        }"#;
        let def = CapabilityDefinition::from_json(raw).unwrap();
        assert_eq!(def.exposes.len(), 1);
        assert!(matches!(def.exposes[0].kind, PropertyKind::Binary { .. }));
    }

    #[test]
    fn missing_model_id_is_an_error() {
        let err = CapabilityDefinition::from_json(r#"{"vendor": "Acme"}"#).unwrap_err();
        assert!(matches!(err, DefinitionError::MissingModelId));
    }

    #[test]
    fn malformed_json_is_an_error() {
        let err = CapabilityDefinition::from_json("{ not json").unwrap_err();
        assert!(matches!(err, DefinitionError::Json(_)));
    }
}
