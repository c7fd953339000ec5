//! [`LoopbackBroker`] – in-process [`BusTransport`] for tests and the shell.
//!
//! Behaves like a single-client broker living in the same process:
//!
//! * **Outbound** – every publish is recorded and fanned out on a broadcast
//!   channel so observers (tests, the shell's monitor) can follow traffic.
//!   Only the most recent [`HISTORY_CAPACITY`] messages are kept.
//!   A publish whose topic matches one of the session's subscriptions is
//!   delivered back to the session, as a real broker would.
//!
//! * **Inbound** – [`inject`](LoopbackBroker::inject) plays an external
//!   client publishing on the broker.
//!
//! The acknowledgement sent on `open` is controlled by [`AckBehaviour`].

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use meshbridge_types::ConnectionError;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::topics::topic_matches;
use crate::transport::{BusTransport, ConnectOptions, TransportEvent};

const EVENT_CAPACITY: usize = 64;
const OBSERVER_CAPACITY: usize = 256;

/// Published messages retained for [`LoopbackBroker::published`].
pub const HISTORY_CAPACITY: usize = 512;

/// What the broker answers when a session is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckBehaviour {
    #[default]
    Accept,
    /// Refuse with the given return code.
    Reject(u8),
    /// Never acknowledge.
    Silent,
}

/// A message published through the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl PublishedMessage {
    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

#[derive(Default)]
struct Inner {
    behaviour: AckBehaviour,
    fail_publish: bool,
    session: Option<mpsc::Sender<TransportEvent>>,
    subscriptions: Vec<String>,
    last_options: Option<ConnectOptions>,
    opens: usize,
    published: VecDeque<PublishedMessage>,
}

impl Inner {
    fn route(&self, topic: &str) -> Option<mpsc::Sender<TransportEvent>> {
        let subscribed = self.subscriptions.iter().any(|f| topic_matches(f, topic));
        if subscribed { self.session.clone() } else { None }
    }

    fn record(&mut self, message: PublishedMessage) {
        if self.published.len() == HISTORY_CAPACITY {
            self.published.pop_front();
        }
        self.published.push_back(message);
    }
}

/// In-process broker.
pub struct LoopbackBroker {
    inner: Mutex<Inner>,
    observers: broadcast::Sender<PublishedMessage>,
}

impl Default for LoopbackBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self::with_behaviour(AckBehaviour::Accept)
    }

    pub fn with_behaviour(behaviour: AckBehaviour) -> Self {
        let (observers, _) = broadcast::channel(OBSERVER_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                behaviour,
                ..Inner::default()
            }),
            observers,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_behaviour(&self, behaviour: AckBehaviour) {
        self.lock().behaviour = behaviour;
    }

    /// Make every subsequent publish fail.
    pub fn set_fail_publish(&self, fail: bool) {
        self.lock().fail_publish = fail;
    }

    /// Follow every message published from now on.
    pub fn watch(&self) -> broadcast::Receiver<PublishedMessage> {
        self.observers.subscribe()
    }

    /// Retained messages, oldest first.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.iter().cloned().collect()
    }

    /// Messages published on exactly `topic`, decoded as JSON.
    pub fn published_on(&self, topic: &str) -> Vec<Value> {
        self.lock()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .filter_map(PublishedMessage::json)
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.lock().subscriptions.clone()
    }

    pub fn last_options(&self) -> Option<ConnectOptions> {
        self.lock().last_options.clone()
    }

    pub fn open_count(&self) -> usize {
        self.lock().opens
    }

    pub fn is_open(&self) -> bool {
        self.lock().session.is_some()
    }

    /// Publish on behalf of another client.  Returns `true` when the session
    /// is subscribed to `topic` and the message was delivered.
    pub async fn inject(&self, topic: &str, payload: &[u8]) -> bool {
        let Some(tx) = self.lock().route(topic) else {
            return false;
        };
        tx.send(TransportEvent::Message {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        })
        .await
        .is_ok()
    }

    /// Drop the session from the broker side with the given reason code.
    pub async fn drop_connection(&self, code: u8) {
        let tx = {
            let mut inner = self.lock();
            inner.subscriptions.clear();
            inner.session.take()
        };
        if let Some(tx) = tx {
            let _ = tx.send(TransportEvent::Disconnected(code)).await;
        }
    }
}

#[async_trait]
impl BusTransport for LoopbackBroker {
    async fn open(
        &self,
        options: &ConnectOptions,
    ) -> Result<mpsc::Receiver<TransportEvent>, ConnectionError> {
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let mut inner = self.lock();
        inner.opens += 1;
        inner.last_options = Some(options.clone());
        inner.subscriptions.clear();
        match inner.behaviour {
            AckBehaviour::Accept => {
                let _ = tx.try_send(TransportEvent::ConnAck(0));
            }
            AckBehaviour::Reject(code) => {
                let _ = tx.try_send(TransportEvent::ConnAck(code));
            }
            AckBehaviour::Silent => {}
        }
        inner.session = Some(tx);
        Ok(rx)
    }

    async fn subscribe(&self, filter: &str) -> Result<(), ConnectionError> {
        let mut inner = self.lock();
        if inner.session.is_none() {
            return Err(ConnectionError::Transport("no open session".to_string()));
        }
        if !inner.subscriptions.iter().any(|f| f == filter) {
            inner.subscriptions.push(filter.to_string());
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ConnectionError> {
        let message = PublishedMessage {
            topic: topic.to_string(),
            payload,
        };
        let echo = {
            let mut inner = self.lock();
            if inner.fail_publish {
                return Err(ConnectionError::Transport("publish refused".to_string()));
            }
            if inner.session.is_none() {
                return Err(ConnectionError::Transport("no open session".to_string()));
            }
            inner.record(message.clone());
            inner.route(topic)
        };
        let _ = self.observers.send(message.clone());
        if let Some(tx) = echo {
            let _ = tx
                .send(TransportEvent::Message {
                    topic: message.topic,
                    payload: message.payload,
                })
                .await;
        }
        Ok(())
    }

    async fn stop_loop(&self) {
        self.lock().session = None;
    }

    async fn close(&self) {
        let mut inner = self.lock();
        inner.session = None;
        inner.subscriptions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ConnectOptions {
        ConnectOptions {
            host: "127.0.0.1".into(),
            port: 1883,
            username: None,
            password: None,
            client_id: "meshbridge-test".into(),
            secure: true,
            keep_alive_secs: 60,
        }
    }

    #[tokio::test]
    async fn open_acknowledges_per_behaviour() {
        let broker = LoopbackBroker::new();
        let mut rx = broker.open(&options()).await.unwrap();
        assert_eq!(rx.recv().await, Some(TransportEvent::ConnAck(0)));

        broker.set_behaviour(AckBehaviour::Reject(5));
        let mut rx = broker.open(&options()).await.unwrap();
        assert_eq!(rx.recv().await, Some(TransportEvent::ConnAck(5)));
        assert_eq!(broker.open_count(), 2);
    }

    #[tokio::test]
    async fn subscribed_publishes_are_echoed() {
        let broker = LoopbackBroker::new();
        let mut rx = broker.open(&options()).await.unwrap();
        let _ack = rx.recv().await;
        broker.subscribe("bridge/+/set").await.unwrap();

        broker.publish("bridge/dev/set", b"{}".to_vec()).await.unwrap();
        broker.publish("bridge/dev/state", b"{}".to_vec()).await.unwrap();

        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Message {
                topic: "bridge/dev/set".into(),
                payload: b"{}".to_vec()
            })
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(broker.published().len(), 2);
    }

    #[tokio::test]
    async fn observers_see_traffic() {
        let broker = LoopbackBroker::new();
        let mut watch = broker.watch();
        let _rx = broker.open(&options()).await.unwrap();
        broker.publish("bridge/x", b"1".to_vec()).await.unwrap();
        let seen = watch.recv().await.unwrap();
        assert_eq!(seen.topic, "bridge/x");
        assert_eq!(broker.published_on("bridge/x"), vec![Value::from(1)]);
    }

    #[tokio::test]
    async fn history_keeps_only_latest_messages() {
        let broker = LoopbackBroker::new();
        let _rx = broker.open(&options()).await.unwrap();
        let total = HISTORY_CAPACITY + 10;
        for i in 0..total {
            broker.publish("bridge/seq", i.to_string().into_bytes()).await.unwrap();
        }

        let published = broker.published();
        assert_eq!(published.len(), HISTORY_CAPACITY);
        assert_eq!(published[0].json(), Some(Value::from(10)));
        assert_eq!(published.last().and_then(PublishedMessage::json), Some(Value::from(total - 1)));
    }

    #[tokio::test]
    async fn publish_without_session_fails() {
        let broker = LoopbackBroker::new();
        assert!(broker.publish("bridge/x", vec![]).await.is_err());
        assert!(broker.subscribe("bridge/#").await.is_err());
    }
}
