//! `meshbridge-hal` – Radio Abstraction Layer
//!
//! The bridge never talks to a radio coordinator directly.  It drives a
//! [`RadioStack`][radio::RadioStack] and receives everything the network does
//! as [`RadioEvent`][radio::RadioEvent]s on a channel.
//!
//! # Modules
//!
//! - [`radio`] – the collaborator surface: [`RadioStack`][radio::RadioStack],
//!   [`RadioConfig`][radio::RadioConfig], [`RadioEvent`][radio::RadioEvent].
//! - [`sim_radio`] – [`SimRadio`][sim_radio::SimRadio]: an in-process stack
//!   for tests and the interactive shell, steered through a
//!   [`SimRadioHandle`][sim_radio::SimRadioHandle].

pub mod radio;
pub mod sim_radio;

pub use radio::{RadioConfig, RadioDevice, RadioEvent, RadioStack, parse_pan_id};
pub use sim_radio::{SimRadio, SimRadioHandle};
