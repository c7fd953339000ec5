//! `meshbridge-middleware` – The Bus Side
//!
//! Moves JSON between the bridge and the message-bus broker without caring
//! what the messages mean.
//!
//! # Modules
//!
//! - [`transport`] – the [`BusTransport`][transport::BusTransport] trait a
//!   broker client implements.
//! - [`bus_gateway`] – [`BusGateway`][bus_gateway::BusGateway]: connect with
//!   bounded acknowledgement wait, fire-and-forget publish, inbound command
//!   delivery.
//! - [`topics`] – topic layout, payload builders and inbound command parsing.
//! - [`loopback`] – [`LoopbackBroker`][loopback::LoopbackBroker]: an
//!   in-process transport for tests and the interactive shell.

pub mod bus_gateway;
pub mod loopback;
pub mod topics;
pub mod transport;

pub use bus_gateway::{BusGateway, InboundMessage, LinkState};
pub use loopback::{AckBehaviour, LoopbackBroker, PublishedMessage};
pub use topics::{BridgeEvent, InboundCommand, Topics};
pub use transport::{BusTransport, ConnectOptions, TransportEvent};
