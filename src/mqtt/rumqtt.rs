//! `rumqttc`-backed [`Connector`].
//!
//! One driver task per link polls the [`EventLoop`], forwards inbound
//! publishes, resolves acknowledgments and applies the reconnect policy.
//!
//! ```text
//! RumqttTransport ──try_*──► AsyncClient ──► EventLoop ◄──poll── driver task
//!        ▲                                                          │
//!        └──────────── ack waiters (AckTracker) ◄───────────────────┤
//!                                                                   ▼
//!                                                     TransportEvent channel
//! ```
//!
//! rumqttc hands out packet ids only when a request leaves the event loop, so
//! acknowledgments are matched in two steps: each request queues a waiter per
//! request kind, the `Outgoing` notification binds the oldest waiter of that
//! kind to its packet id, and the matching ack resolves it.
//!
//! Requests are refused while the link is down. Whatever rumqttc still holds
//! for a dead session is discarded, so nothing a caller saw fail is sent later.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ClientError, Event, EventLoop, MqttOptions, Outgoing, Packet,
    SubscribeReasonCode,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::config::{Endpoint, MqttConfig, ReconnectConfig, TransportKind};
use super::error::TransportError;
use super::transport::{Connector, Link, PublishOptions, QoS, Transport, TransportEvent};

type AckResult = Result<(), TransportError>;
type AckSender = oneshot::Sender<AckResult>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum AckKind {
    Subscribe,
    Unsubscribe,
    Publish,
}

/// Pending acknowledgments of one link.
#[derive(Default)]
struct AckTracker {
    /// Requests handed to the client but not yet seen leaving the event loop.
    /// `None` marks a request nobody waits for (QoS 0 publish).
    queued: HashMap<AckKind, VecDeque<Option<AckSender>>>,
    in_flight: HashMap<(AckKind, u16), AckSender>,
}

impl AckTracker {
    fn enqueue(&mut self, kind: AckKind, waiter: Option<AckSender>) {
        self.queued.entry(kind).or_default().push_back(waiter);
    }

    fn bind(&mut self, kind: AckKind, pkid: u16) {
        let head = self.queued.get_mut(&kind).and_then(VecDeque::pop_front);
        if let Some(Some(waiter)) = head {
            self.in_flight.insert((kind, pkid), waiter);
        }
    }

    fn resolve(&mut self, kind: AckKind, pkid: u16, result: AckResult) {
        match self.in_flight.remove(&(kind, pkid)) {
            Some(waiter) => {
                let _ = waiter.send(result);
            }
            None => trace!(?kind, pkid, "ack without waiter"),
        }
    }

    fn fail_all(&mut self, error: TransportError) {
        let queued = self.queued.drain().flat_map(|(_, q)| q.into_iter().flatten());
        let in_flight = self.in_flight.drain().map(|(_, w)| w);
        for waiter in queued.chain(in_flight) {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    #[cfg(test)]
    fn waiting(&self) -> usize {
        let queued: usize = self
            .queued
            .values()
            .map(|q| q.iter().filter(|w| w.is_some()).count())
            .sum();
        queued + self.in_flight.len()
    }
}

fn lock(acks: &Mutex<AckTracker>) -> MutexGuard<'_, AckTracker> {
    acks.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Opens rumqttc connections using the session settings of an [`MqttConfig`].
pub struct RumqttConnector {
    config: MqttConfig,
}

impl RumqttConnector {
    pub fn new(config: MqttConfig) -> Self {
        Self { config }
    }

    fn options(&self, endpoint: &Endpoint, client_id: &str) -> MqttOptions {
        let mut options = MqttOptions::new(client_id, endpoint.broker_addr(), endpoint.port);
        options
            .set_keep_alive(self.config.keep_alive)
            .set_clean_session(true);

        if let Some((user, password)) = &self.config.credentials {
            options.set_credentials(user.clone(), password.clone());
        }

        match endpoint.transport {
            TransportKind::Tcp => {}
            TransportKind::Ws => {
                options.set_transport(rumqttc::Transport::Ws);
            }
            TransportKind::Wss => {
                options.set_transport(rumqttc::Transport::wss_with_default_config());
            }
        }
        options
    }
}

#[async_trait]
impl Connector for RumqttConnector {
    async fn open(&self, endpoint: &Endpoint, client_id: &str) -> Result<Link, TransportError> {
        info!(%endpoint, client_id, "opening mqtt connection");

        let (client, eventloop) =
            AsyncClient::new(self.options(endpoint, client_id), self.config.request_capacity);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (handshake_tx, handshake_rx) = oneshot::channel();
        let acks = Arc::new(Mutex::new(AckTracker::default()));
        let shutdown = CancellationToken::new();
        let closed = CancellationToken::new();
        let link_up = Arc::new(AtomicBool::new(false));

        let driver = Driver {
            eventloop,
            events: events_tx,
            acks: acks.clone(),
            reconnect: self.config.reconnect.clone(),
            shutdown: shutdown.clone(),
            closed: closed.clone(),
            link_up: link_up.clone(),
            endpoint: endpoint.to_string(),
        };

        // Stops the driver if the handshake fails or this future is dropped.
        let guard = shutdown.clone().drop_guard();
        tokio::spawn(driver.run(handshake_tx));

        let handshake = match tokio::time::timeout(self.config.connect_timeout, handshake_rx).await
        {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Connect(
                "driver stopped during handshake".to_string(),
            )),
            Err(_) => Err(TransportError::Timeout(self.config.connect_timeout)),
        };
        handshake?;
        guard.disarm();

        Ok(Link {
            transport: Box::new(RumqttTransport {
                client,
                acks,
                ack_timeout: self.config.ack_timeout,
                disconnect_timeout: self.config.disconnect_timeout,
                shutdown,
                closed,
                link_up,
            }),
            events: events_rx,
        })
    }
}

struct RumqttTransport {
    client: AsyncClient,
    acks: Arc<Mutex<AckTracker>>,
    ack_timeout: Duration,
    disconnect_timeout: Duration,
    /// Cancels the driver task
    shutdown: CancellationToken,
    /// Cancelled by the driver when it exits
    closed: CancellationToken,
    /// Set by the driver while a session is established
    link_up: Arc<AtomicBool>,
}

impl RumqttTransport {
    /// Hands a request to the client and queues its waiter under one lock so
    /// the queue order matches the order requests leave the event loop.
    fn request<F>(
        &self,
        kind: AckKind,
        wait: bool,
        send: F,
    ) -> Result<Option<oneshot::Receiver<AckResult>>, TransportError>
    where
        F: FnOnce(&AsyncClient) -> Result<(), ClientError>,
    {
        // the driver flips `link_up` under the same lock
        let mut acks = lock(&self.acks);
        if self.closed.is_cancelled() || !self.link_up.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionLost);
        }
        send(&self.client).map_err(|e| TransportError::Request(e.to_string()))?;

        if wait {
            let (tx, rx) = oneshot::channel();
            acks.enqueue(kind, Some(tx));
            Ok(Some(rx))
        } else {
            acks.enqueue(kind, None);
            Ok(None)
        }
    }

    async fn await_ack(&self, rx: Option<oneshot::Receiver<AckResult>>) -> AckResult {
        let Some(rx) = rx else {
            return Ok(());
        };
        match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::ConnectionLost),
            Err(_) => Err(TransportError::AckTimeout(self.ack_timeout)),
        }
    }
}

#[async_trait]
impl Transport for RumqttTransport {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        let rx = self.request(AckKind::Subscribe, true, |client| {
            client.try_subscribe(topic, qos.into())
        })?;
        self.await_ack(rx).await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let rx = self.request(AckKind::Unsubscribe, true, |client| {
            client.try_unsubscribe(topic)
        })?;
        self.await_ack(rx).await
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), TransportError> {
        let wait = options.qos != QoS::AtMostOnce;
        let rx = self.request(AckKind::Publish, wait, |client| {
            client.try_publish(topic, options.qos.into(), options.retain, payload)
        })?;
        self.await_ack(rx).await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        if !self.link_up.load(Ordering::SeqCst) {
            debug!("link down, stopping reconnect");
            self.shutdown.cancel();
            return Ok(());
        }

        if let Err(e) = self.client.try_disconnect() {
            self.shutdown.cancel();
            return Err(TransportError::Request(e.to_string()));
        }

        let flushed = tokio::time::timeout(self.disconnect_timeout, self.closed.cancelled())
            .await
            .is_ok();
        self.shutdown.cancel();

        if flushed {
            debug!("disconnect flushed");
            Ok(())
        } else {
            warn!("disconnect not confirmed, dropping connection");
            Err(TransportError::AckTimeout(self.disconnect_timeout))
        }
    }
}

impl Drop for RumqttTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Driver {
    eventloop: EventLoop,
    events: mpsc::UnboundedSender<TransportEvent>,
    acks: Arc<Mutex<AckTracker>>,
    reconnect: ReconnectConfig,
    shutdown: CancellationToken,
    closed: CancellationToken,
    link_up: Arc<AtomicBool>,
    endpoint: String,
}

impl Driver {
    async fn run(mut self, handshake: oneshot::Sender<AckResult>) {
        match self.handshake().await {
            Ok(()) => {
                info!(endpoint = %self.endpoint, "mqtt handshake complete");
                self.set_link_up(true);
                if handshake.send(Ok(())).is_ok() {
                    self.pump().await;
                }
            }
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "mqtt handshake failed");
                let _ = handshake.send(Err(e));
            }
        }

        self.set_link_up(false);
        lock(&self.acks).fail_all(TransportError::ConnectionLost);
        self.closed.cancel();
        debug!(endpoint = %self.endpoint, "mqtt driver stopped");
    }

    async fn handshake(&mut self) -> AckResult {
        loop {
            let polled = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Err(TransportError::Connect("cancelled".to_string()));
                }
                polled = self.eventloop.poll() => polled,
            };

            match polled {
                Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                Ok(_) => {}
                Err(e) => return Err(TransportError::Connect(e.to_string())),
            }
        }
    }

    async fn pump(&mut self) {
        let mut connected = true;
        let mut attempt: u32 = 0;

        loop {
            let polled = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                polled = self.eventloop.poll() => polled.map_err(|e| e.to_string()),
            };

            match polled {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    if !connected {
                        connected = true;
                        attempt = 0;
                        self.set_link_up(true);
                        info!(endpoint = %self.endpoint, "mqtt reconnected");
                        self.emit(TransportEvent::Reconnected);
                    }
                }
                Ok(Event::Incoming(packet)) => self.on_incoming(packet),
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!(endpoint = %self.endpoint, "disconnect sent");
                    return;
                }
                Ok(Event::Outgoing(outgoing)) => self.on_outgoing(outgoing),
                Err(reason) => {
                    self.discard_session();

                    if connected {
                        connected = false;
                        warn!(endpoint = %self.endpoint, error = %reason, "mqtt connection lost");
                        self.emit(TransportEvent::Lost {
                            reason: reason.clone(),
                        });
                    }

                    attempt = attempt.saturating_add(1);
                    if self.reconnect.is_exhausted(attempt) {
                        warn!(endpoint = %self.endpoint, attempt, "giving up on reconnect");
                        self.emit(TransportEvent::GaveUp { reason });
                        return;
                    }

                    let delay = self.reconnect.delay_for_attempt(attempt);
                    info!(
                        endpoint = %self.endpoint,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "reconnecting"
                    );
                    self.emit(TransportEvent::Reconnecting { attempt });

                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn set_link_up(&self, up: bool) {
        let _acks = lock(&self.acks);
        self.link_up.store(up, Ordering::SeqCst);
    }

    /// Drops everything bound to the failed session: requests still queued in
    /// the client and unacked publishes, which rumqttc would otherwise replay
    /// after the next ConnAck, and every waiter.
    fn discard_session(&mut self) {
        let mut acks = lock(&self.acks);
        self.link_up.store(false, Ordering::SeqCst);
        self.eventloop.clean();
        let dropped = self.eventloop.pending.len();
        self.eventloop.pending.clear();
        acks.fail_all(TransportError::ConnectionLost);
        if dropped > 0 {
            debug!(endpoint = %self.endpoint, dropped, "discarded requests of the lost session");
        }
    }

    fn on_incoming(&mut self, packet: Packet) {
        match packet {
            Packet::Publish(publish) => {
                trace!(topic = %publish.topic, bytes = publish.payload.len(), "publish received");
                self.emit(TransportEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                });
            }
            Packet::SubAck(ack) => {
                let refused = ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                let result = if refused {
                    Err(TransportError::Rejected(format!(
                        "subscribe refused (pkid {})",
                        ack.pkid
                    )))
                } else {
                    Ok(())
                };
                lock(&self.acks).resolve(AckKind::Subscribe, ack.pkid, result);
            }
            Packet::UnsubAck(ack) => {
                lock(&self.acks).resolve(AckKind::Unsubscribe, ack.pkid, Ok(()));
            }
            Packet::PubAck(ack) => {
                lock(&self.acks).resolve(AckKind::Publish, ack.pkid, Ok(()));
            }
            Packet::PubComp(ack) => {
                lock(&self.acks).resolve(AckKind::Publish, ack.pkid, Ok(()));
            }
            _ => {}
        }
    }

    fn on_outgoing(&mut self, outgoing: Outgoing) {
        let mut acks = lock(&self.acks);
        match outgoing {
            Outgoing::Subscribe(pkid) => acks.bind(AckKind::Subscribe, pkid),
            Outgoing::Unsubscribe(pkid) => acks.bind(AckKind::Unsubscribe, pkid),
            Outgoing::Publish(pkid) => acks.bind(AckKind::Publish, pkid),
            _ => {}
        }
    }

    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            trace!("event receiver dropped");
        }
    }
}
