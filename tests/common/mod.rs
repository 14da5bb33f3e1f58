#![allow(dead_code, clippy::unwrap_used)]
// In-memory broker for driving `MqttHandle` without a network.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use kostboard::mqtt::{
    ConnectionState, Connector, Endpoint, Link, MqttConfig, MqttHandle, MqttMessage,
    PublishOptions, QoS, Transport, TransportError, TransportEvent,
};

pub const WAIT: Duration = Duration::from_secs(2);

#[derive(Default)]
struct State {
    connects: Vec<Endpoint>,
    subscribes: BTreeMap<String, usize>,
    unsubscribes: BTreeMap<String, usize>,
    publishes: Vec<(String, String)>,
    disconnects: usize,
    refused: HashSet<String>,
    fail_connect: bool,
    hang_connect: bool,
    hang_disconnect: bool,
    /// Subscribing this topic takes the link down
    lose_link_at: Option<String>,
    link_down: bool,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
}

/// Records every transport call and lets tests inject link events.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<State>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            broker: self.clone(),
        })
    }

    pub fn spawn(&self, config: MqttConfig) -> MqttHandle {
        MqttHandle::spawn(config, self.connector()).0
    }

    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    // ── Call counters ───────────────────────────────────────────────

    pub fn connects(&self) -> usize {
        self.with(|s| s.connects.len())
    }

    pub fn subscribe_calls(&self) -> BTreeMap<String, usize> {
        self.with(|s| s.subscribes.clone())
    }

    pub fn unsubscribe_calls(&self) -> BTreeMap<String, usize> {
        self.with(|s| s.unsubscribes.clone())
    }

    pub fn publish_calls(&self) -> Vec<(String, String)> {
        self.with(|s| s.publishes.clone())
    }

    pub fn disconnects(&self) -> usize {
        self.with(|s| s.disconnects)
    }

    pub fn reset_calls(&self) {
        self.with(|s| {
            s.subscribes.clear();
            s.unsubscribes.clear();
            s.publishes.clear();
        });
    }

    // ── Behaviour ───────────────────────────────────────────────────

    pub fn refuse(&self, topic: &str) {
        self.with(|s| s.refused.insert(topic.to_string()));
    }

    pub fn fail_connects(&self, fail: bool) {
        self.with(|s| s.fail_connect = fail);
    }

    /// `Connector::open` never resolves.
    pub fn hang_connects(&self, hang: bool) {
        self.with(|s| s.hang_connect = hang);
    }

    /// `Transport::disconnect` never resolves.
    pub fn hang_disconnects(&self, hang: bool) {
        self.with(|s| s.hang_disconnect = hang);
    }

    /// The link drops while `topic` is being subscribed. Requests fail with
    /// `ConnectionLost` until [`restore_connection`](Self::restore_connection).
    pub fn lose_link_at(&self, topic: &str) {
        self.with(|s| s.lose_link_at = Some(topic.to_string()));
    }

    fn emit(&self, event: TransportEvent) {
        let sender = self.with(|s| s.events.clone()).expect("no open link");
        sender.send(event).unwrap();
    }

    pub fn deliver(&self, topic: &str, payload: &str) {
        self.emit(TransportEvent::Message {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
        });
    }

    pub fn drop_connection(&self) {
        self.emit(TransportEvent::Lost {
            reason: "keep alive timeout".to_string(),
        });
    }

    pub fn restore_connection(&self) {
        self.with(|s| s.link_down = false);
        self.emit(TransportEvent::Reconnecting { attempt: 1 });
        self.emit(TransportEvent::Reconnected);
    }

    pub fn give_up(&self) {
        self.emit(TransportEvent::GaveUp {
            reason: "max attempts reached".to_string(),
        });
    }
}

struct MockConnector {
    broker: MockBroker,
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, endpoint: &Endpoint, _client_id: &str) -> Result<Link, TransportError> {
        if self.broker.with(|s| s.hang_connect) {
            std::future::pending::<()>().await;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let fail = self.broker.with(|s| {
            s.connects.push(endpoint.clone());
            if !s.fail_connect {
                s.events = Some(tx);
            }
            s.fail_connect
        });
        if fail {
            return Err(TransportError::Connect("connection refused".to_string()));
        }

        Ok(Link {
            transport: Box::new(MockTransport {
                broker: self.broker.clone(),
            }),
            events: rx,
        })
    }
}

struct MockTransport {
    broker: MockBroker,
}

#[async_trait]
impl Transport for MockTransport {
    async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), TransportError> {
        self.broker.with(|s| {
            *s.subscribes.entry(topic.to_string()).or_default() += 1;
            if s.link_down {
                return Err(TransportError::ConnectionLost);
            }
            if s.lose_link_at.as_deref() == Some(topic) {
                s.lose_link_at = None;
                s.link_down = true;
                if let Some(events) = &s.events {
                    let _ = events.send(TransportEvent::Lost {
                        reason: "connection reset".to_string(),
                    });
                }
                return Err(TransportError::ConnectionLost);
            }
            if s.refused.contains(topic) {
                Err(TransportError::Rejected("not authorized".to_string()))
            } else {
                Ok(())
            }
        })
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.broker.with(|s| {
            *s.unsubscribes.entry(topic.to_string()).or_default() += 1;
        });
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        _options: PublishOptions,
    ) -> Result<(), TransportError> {
        let payload = String::from_utf8(payload).unwrap();
        self.broker
            .with(|s| s.publishes.push((topic.to_string(), payload)));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let hang = self.broker.with(|s| {
            s.disconnects += 1;
            s.events = None;
            s.hang_disconnect
        });
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

pub fn config_with(default_topics: &[&str]) -> MqttConfig {
    MqttConfig {
        default_topics: default_topics.iter().map(|t| t.to_string()).collect(),
        ..MqttConfig::default()
    }
}

pub async fn wait_for_state(handle: &MqttHandle, state: ConnectionState) {
    let mut status = handle.watch_status();
    tokio::time::timeout(WAIT, status.wait_for(|s| s.connection_state == state))
        .await
        .unwrap_or_else(|_| panic!("state never became {state:?}"))
        .unwrap();
}

/// Collects the next `count` cache updates.
pub async fn next_updates(
    updates: &mut tokio::sync::broadcast::Receiver<MqttMessage>,
    count: usize,
) -> Vec<MqttMessage> {
    let mut received = Vec::with_capacity(count);
    for _ in 0..count {
        let message = tokio::time::timeout(WAIT, updates.recv())
            .await
            .expect("update did not arrive")
            .unwrap();
        received.push(message);
    }
    received
}

pub fn counts(pairs: &[(&str, usize)]) -> BTreeMap<String, usize> {
    pairs.iter().map(|(t, n)| (t.to_string(), *n)).collect()
}
