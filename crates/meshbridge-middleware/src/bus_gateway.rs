//! [`BusGateway`] – the bridge's session with the message-bus broker.
//!
//! The gateway:
//!
//! 1. **Connects** through a [`BusTransport`], resolving the broker host
//!    first so DNS failures are told apart from broker failures, and waits a
//!    bounded time for the broker's acknowledgement.
//!
//! 2. **Publishes** JSON payloads, fire-and-forget: nothing is queued while
//!    disconnected and nothing is retried.
//!
//! 3. **Delivers** inbound command messages.  A gateway-owned pump task
//!    consumes transport events, tracks the link state and forwards every
//!    JSON message to the inbound channel returned by
//!    [`take_inbound`](BusGateway::take_inbound).

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use meshbridge_types::{BridgeError, ConnectionError};
use serde_json::Value;
use tokio::net::lookup_host;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::topics::Topics;
use crate::transport::{BusTransport, ConnectOptions, TransportEvent};

/// How long `connect` waits for the broker's acknowledgement.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const INBOUND_CAPACITY: usize = 128;
const KEEP_ALIVE_SECS: u16 = 60;

/// State of the broker link as seen by the pump task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Rejected(u8),
}

/// A JSON message received on one of the command filters.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Value,
}

/// Human-readable reason for a refused connection acknowledgement.
pub fn connack_reason(code: u8) -> &'static str {
    match code {
        1 => "incorrect protocol version",
        2 => "invalid client identifier",
        3 => "server unavailable",
        4 => "bad username or password",
        5 => "not authorized",
        _ => "unknown code",
    }
}

/// Broker session owner.  Shared behind an `Arc` by the controller (which
/// publishes) and the composition root (which connects and disconnects).
pub struct BusGateway {
    transport: Arc<dyn BusTransport>,
    topics: Topics,
    link: watch::Sender<LinkState>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl BusGateway {
    pub fn new(transport: Arc<dyn BusTransport>, topics: Topics) -> Self {
        let (link, _) = watch::channel(LinkState::Disconnected);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        Self {
            transport,
            topics,
            link,
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            pump: Mutex::new(None),
        }
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn link_state(&self) -> LinkState {
        *self.link.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.link_state() == LinkState::Connected
    }

    /// Watch the link state.
    pub fn subscribe_link(&self) -> watch::Receiver<LinkState> {
        self.link.subscribe()
    }

    /// Hand out the inbound command channel.  Only the first call gets it.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<InboundMessage>> {
        lock(&self.inbound_rx).take()
    }

    // -----------------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------------

    /// Open a new broker session, dropping any previous one.
    ///
    /// # Errors
    ///
    /// * [`BridgeError::Configuration`] – empty host or port outside
    ///   1024–65535; nothing touches the network.
    /// * [`ConnectionError::Resolution`] – the host name did not resolve.
    /// * [`ConnectionError::Timeout`] – no acknowledgement in time; the
    ///   transport loop is stopped.
    /// * [`ConnectionError::Rejected`] – the broker refused the session.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<(), BridgeError> {
        let host = host.trim();
        if host.is_empty() {
            return Err(BridgeError::Configuration(
                "broker host must not be empty".to_string(),
            ));
        }
        if port < 1024 {
            return Err(BridgeError::Configuration(format!(
                "broker port must be 1024-65535, got {port}"
            )));
        }

        self.disconnect().await;

        let resolved = lookup_host((host, port))
            .await
            .map_err(|e| ConnectionError::Resolution {
                host: host.to_string(),
                reason: e.to_string(),
            })?
            .next()
            .ok_or_else(|| ConnectionError::Resolution {
                host: host.to_string(),
                reason: "no addresses returned".to_string(),
            })?;
        debug!(host, addr = %resolved, "broker host resolved");

        let options = ConnectOptions {
            host: host.to_string(),
            port,
            username: username.map(str::to_string),
            password: password.map(str::to_string),
            client_id: format!("meshbridge-{}", Uuid::new_v4().simple()),
            secure: true,
            keep_alive_secs: KEEP_ALIVE_SECS,
        };

        self.link.send_replace(LinkState::Connecting);
        let events = match self.transport.open(&options).await {
            Ok(events) => events,
            Err(e) => {
                self.link.send_replace(LinkState::Disconnected);
                return Err(e.into());
            }
        };

        let mut watcher = self.link.subscribe();
        let pump = tokio::spawn(pump(
            events,
            Arc::clone(&self.transport),
            self.topics.clone(),
            self.link.clone(),
            self.inbound_tx.clone(),
        ));
        *lock(&self.pump) = Some(pump);

        let outcome = tokio::time::timeout(CONNECT_TIMEOUT, async {
            watcher
                .wait_for(|s| matches!(s, LinkState::Connected | LinkState::Rejected(_)))
                .await
                .map(|s| *s)
        })
        .await;

        match outcome {
            Ok(Ok(LinkState::Connected)) => {
                info!(host, port, client_id = %options.client_id, "connected to broker");
                Ok(())
            }
            Ok(Ok(LinkState::Rejected(code))) => {
                self.abandon_session().await;
                let reason = connack_reason(code);
                warn!(host, port, code, reason, "broker rejected connection");
                Err(ConnectionError::Rejected {
                    code,
                    reason: reason.to_string(),
                }
                .into())
            }
            Ok(_) => {
                self.abandon_session().await;
                Err(ConnectionError::Transport("link state channel closed".to_string()).into())
            }
            Err(_) => {
                self.abandon_session().await;
                warn!(host, port, "broker did not acknowledge in time");
                Err(ConnectionError::Timeout {
                    secs: CONNECT_TIMEOUT.as_secs(),
                }
                .into())
            }
        }
    }

    /// Stop the network loop of a session that never became usable.
    async fn abandon_session(&self) {
        if let Some(handle) = lock(&self.pump).take() {
            handle.abort();
        }
        self.transport.stop_loop().await;
        self.link.send_replace(LinkState::Disconnected);
    }

    /// End the current session.  Safe to call when not connected.
    pub async fn disconnect(&self) {
        let handle = lock(&self.pump).take();
        if let Some(handle) = handle {
            handle.abort();
            self.transport.stop_loop().await;
            self.transport.close().await;
            info!("disconnected from broker");
        }
        self.link.send_replace(LinkState::Disconnected);
    }

    // -----------------------------------------------------------------------
    // Publishing
    // -----------------------------------------------------------------------

    /// Serialise and send `payload`.  Returns `false` when not connected or
    /// when the transport refuses the message.
    pub async fn publish(&self, topic: &str, payload: &Value) -> bool {
        if !self.is_connected() {
            debug!(topic, "not connected, message dropped");
            return false;
        }
        let bytes = match serde_json::to_vec(payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(topic, error = %e, "payload serialisation failed");
                return false;
            }
        };
        match self.transport.publish(topic, bytes).await {
            Ok(()) => true,
            Err(e) => {
                warn!(topic, error = %e, "publish failed");
                false
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Leave `Connected` for `Disconnected`.  A pending `Rejected` is kept so the
/// connecting caller still observes it.
fn mark_lost(link: &watch::Sender<LinkState>) {
    link.send_if_modified(|state| {
        if *state == LinkState::Connected || *state == LinkState::Connecting {
            *state = LinkState::Disconnected;
            true
        } else {
            false
        }
    });
}

async fn pump(
    mut events: mpsc::Receiver<TransportEvent>,
    transport: Arc<dyn BusTransport>,
    topics: Topics,
    link: watch::Sender<LinkState>,
    inbound: mpsc::Sender<InboundMessage>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::ConnAck(0) => {
                for filter in topics.command_filters() {
                    if let Err(e) = transport.subscribe(&filter).await {
                        warn!(filter = %filter, error = %e, "subscribe failed");
                    }
                }
                link.send_replace(LinkState::Connected);
            }
            TransportEvent::ConnAck(code) => {
                link.send_replace(LinkState::Rejected(code));
            }
            TransportEvent::Disconnected(code) => {
                if code != 0 {
                    warn!(code, "broker connection lost");
                }
                mark_lost(&link);
            }
            TransportEvent::Message { topic, payload } => {
                match serde_json::from_slice::<Value>(&payload) {
                    Ok(payload) => {
                        if inbound.send(InboundMessage { topic, payload }).await.is_err() {
                            debug!("inbound channel closed");
                        }
                    }
                    Err(e) => warn!(topic = %topic, error = %e, "non-JSON message dropped"),
                }
            }
        }
    }
    mark_lost(&link);
}
