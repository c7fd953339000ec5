//! `meshbridge-runtime` – The Bridge Engine
//!
//! Where radio events become bus messages and bus commands become device
//! state.
//!
//! # Modules
//!
//! - [`network_controller`] – [`NetworkController`][network_controller::NetworkController]:
//!   the single task owning the device map, the state store, the permit-join
//!   window and the radio stack.  Driven through a cloneable
//!   [`ControllerHandle`][network_controller::ControllerHandle]; readers get
//!   a [`NetworkSnapshot`][network_controller::NetworkSnapshot].
//! - [`bridge_core`] – [`BridgeCore`][bridge_core::BridgeCore]: composition
//!   root that loads definitions, wires gateway and controller together and
//!   dispatches inbound bus commands.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: console
//!   logging with an optional OTLP span exporter.

pub mod bridge_core;
pub mod network_controller;
pub mod telemetry;

pub use bridge_core::{BridgeConfig, BridgeCore, BrokerSettings};
pub use network_controller::{
    CommandEnvelope, ControllerCommand, ControllerHandle, DEFAULT_COMMAND_TIMEOUT,
    NetworkController, NetworkSnapshot,
};
pub use telemetry::{TracerProviderGuard, init_tracing};
