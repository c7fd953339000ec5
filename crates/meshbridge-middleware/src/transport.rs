//! The bus transport collaborator surface.
//!
//! The bridge never speaks the broker wire protocol itself.  A
//! [`BusTransport`] owns the socket, TLS and framing; the
//! [`BusGateway`][crate::bus_gateway::BusGateway] drives it and consumes the
//! [`TransportEvent`]s it produces.

use std::fmt;

use async_trait::async_trait;
use meshbridge_types::ConnectionError;
use tokio::sync::mpsc;

/// Everything needed to open one broker session.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    /// Request a TLS session.
    pub secure: bool,
    pub keep_alive_secs: u16,
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[redacted]"))
            .field("client_id", &self.client_id)
            .field("secure", &self.secure)
            .field("keep_alive_secs", &self.keep_alive_secs)
            .finish()
    }
}

/// Something the broker session did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Connection acknowledgement; `0` means accepted.
    ConnAck(u8),
    /// Session ended; `0` means a clean disconnect.
    Disconnected(u8),
    Message { topic: String, payload: Vec<u8> },
}

/// A broker client.
///
/// `open` starts the client's network loop and returns the channel it
/// reports on; the loop keeps running until [`stop_loop`](Self::stop_loop).
#[async_trait]
pub trait BusTransport: Send + Sync {
    async fn open(
        &self,
        options: &ConnectOptions,
    ) -> Result<mpsc::Receiver<TransportEvent>, ConnectionError>;

    async fn subscribe(&self, filter: &str) -> Result<(), ConnectionError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ConnectionError>;

    /// Stop the network loop without a protocol-level disconnect.
    async fn stop_loop(&self);

    /// Close the session.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_password() {
        let opts = ConnectOptions {
            host: "broker.local".into(),
            port: 8883,
            username: Some("bridge".into()),
            password: Some("hunter2".into()),
            client_id: "meshbridge-test".into(),
            secure: true,
            keep_alive_secs: 60,
        };
        let dbg = format!("{opts:?}");
        assert!(dbg.contains("[redacted]"));
        assert!(!dbg.contains("hunter2"));
    }
}
