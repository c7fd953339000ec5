//! `meshbridge-kernel` – Device Knowledge & Rules
//!
//! Everything the bridge knows about device models and device state, with no
//! I/O beyond reading definition files.
//!
//! # Modules
//!
//! - [`definition`] – [`CapabilityDefinition`][definition::CapabilityDefinition]
//!   and the closed [`PropertyKind`][definition::PropertyKind] each exposed
//!   property is converted into at load time.
//! - [`capability_registry`] – [`CapabilityRegistry`][capability_registry::CapabilityRegistry]:
//!   loads definitions from disk, identifies joining devices by model or
//!   vendor, and validates property values.
//! - [`state_store`] – [`StateStore`][state_store::StateStore]: per-device
//!   state maps whose every write is validated against the device's
//!   definition.
//! - [`permit_join`] – [`PermitJoinWindow`][permit_join::PermitJoinWindow]:
//!   the network-wide join window with lazy expiry.

pub mod capability_registry;
pub mod definition;
pub mod permit_join;
pub mod state_store;

pub use capability_registry::CapabilityRegistry;
pub use definition::{CapabilityDefinition, DefinitionError, ExposedProperty, PropertyKind};
pub use permit_join::{
    DEFAULT_PERMIT_JOIN_SECS, MAX_PERMIT_JOIN_SECS, PermitJoinWindow, validate_duration,
};
pub use state_store::StateStore;
