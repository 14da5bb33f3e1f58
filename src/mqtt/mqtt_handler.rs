//! Connection manager.
//!
//! [`MqttHandler`] runs as a single task and is the only owner of the live
//! link, the [`TopicRegistry`] and the write side of the [`LastValueCache`].
//! Everything else talks to it through a cloneable [`MqttHandle`]: requests go
//! in over a channel and are answered through a oneshot, connection state comes
//! back through a `watch` channel.
//!
//! ```text
//! MqttHandle ──HandlerCommand──►┐
//!                               ├─► MqttHandler ──► Transport (requests)
//! Link events ──TransportEvent─►┘        │
//!                                        ├─► LastValueCache (writes, broadcast)
//!                                        └─► watch<MqttStatus>
//! ```

use std::sync::Arc;

use chrono::{DateTime, Local};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::commands::Command;
use super::config::{Endpoint, MqttConfig};
use super::error::{SubscriptionError, SyncError, TransportError};
use super::message_manager::LastValueCache;
use super::topics::{
    is_valid_publish_topic, validate_filter, Subscription, SubscriptionState, TopicOutcome,
    TopicRegistry,
};
use super::transport::{Connector, PublishOptions, QoS, Transport, TransportEvent};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Reconnecting,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MqttStatus {
    pub connection_state: ConnectionState,
    pub last_error: Option<String>,
    pub client_id: Option<String>,
    pub endpoint: Option<String>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<DateTime<Local>>,
    /// Current attempt while the client reconnects on its own, 0 otherwise
    pub reconnect_attempt: u32,
}

impl MqttStatus {
    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }
}

type Reply<T> = oneshot::Sender<Result<T, SyncError>>;

enum HandlerCommand {
    Connect {
        endpoint: Option<Endpoint>,
        respond_to: Reply<()>,
    },
    Disconnect {
        respond_to: Reply<()>,
    },
    Subscribe {
        topics: Vec<String>,
        respond_to: Reply<Vec<TopicOutcome>>,
    },
    Unsubscribe {
        topics: Vec<String>,
        respond_to: Reply<Vec<TopicOutcome>>,
    },
    Publish {
        topic: String,
        payload: Vec<u8>,
        options: PublishOptions,
        respond_to: Reply<()>,
    },
    Subscriptions {
        respond_to: Reply<Vec<Subscription>>,
    },
}

enum Next {
    Command(HandlerCommand),
    Event(Option<TransportEvent>),
    Shutdown,
}

pub struct MqttHandler {
    config: MqttConfig,
    connector: Arc<dyn Connector>,
    transport: Option<Box<dyn Transport>>,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    /// Endpoint of the current link
    endpoint: Option<Endpoint>,
    registry: TopicRegistry,
    cache: LastValueCache,
    status: watch::Sender<MqttStatus>,
    commands: mpsc::Receiver<HandlerCommand>,
}

async fn recv_event(
    events: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl MqttHandler {
    async fn run(mut self) {
        info!(
            default_topics = self.registry.len(),
            "MQTT handler started"
        );

        loop {
            let next = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => Next::Command(command),
                    None => Next::Shutdown,
                },
                event = recv_event(&mut self.events) => Next::Event(event),
            };

            match next {
                Next::Command(command) => self.handle_command(command).await,
                Next::Event(Some(event)) => self.handle_event(event).await,
                Next::Event(None) => self.link_closed(),
                Next::Shutdown => break,
            }
        }

        if let Err(e) = self.teardown().await {
            warn!("Disconnect on shutdown failed: {}", e);
        }
        info!("MQTT handler stopped");
    }

    async fn handle_command(&mut self, command: HandlerCommand) {
        match command {
            HandlerCommand::Connect {
                endpoint,
                respond_to,
            } => {
                let result = self.connect(endpoint).await;
                let _ = respond_to.send(result);
            }
            HandlerCommand::Disconnect { respond_to } => {
                let result = self.disconnect().await;
                let _ = respond_to.send(result);
            }
            HandlerCommand::Subscribe { topics, respond_to } => {
                let result = if self.is_connected() {
                    Ok(self.subscribe_topics(topics).await)
                } else {
                    Err(SyncError::NotConnected)
                };
                let _ = respond_to.send(result);
            }
            HandlerCommand::Unsubscribe { topics, respond_to } => {
                let result = if self.is_connected() {
                    Ok(self.unsubscribe_topics(topics).await)
                } else {
                    Err(SyncError::NotConnected)
                };
                let _ = respond_to.send(result);
            }
            HandlerCommand::Publish {
                topic,
                payload,
                options,
                respond_to,
            } => {
                let result = self.publish(topic, payload, options).await;
                let _ = respond_to.send(result);
            }
            HandlerCommand::Subscriptions { respond_to } => {
                let _ = respond_to.send(Ok(self.registry.snapshot()));
            }
        }
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message { topic, payload } => {
                let message = self.cache.record(&topic, &payload);
                debug!(topic = %message.topic, payload = %message.content, "message received");
                self.update_counters(|s| {
                    s.messages_received += 1;
                    s.last_activity = Some(message.timestamp);
                });
            }
            TransportEvent::Lost { reason } => {
                warn!(reason = %reason, "MQTT connection lost");
                self.registry.suspend();
                self.update_status(|s| {
                    s.connection_state = ConnectionState::Disconnected;
                    s.last_error = Some(reason);
                });
            }
            TransportEvent::Reconnecting { attempt } => {
                info!(attempt, "MQTT reconnecting");
                self.update_status(|s| {
                    s.connection_state = ConnectionState::Reconnecting;
                    s.reconnect_attempt = attempt;
                });
            }
            TransportEvent::Reconnected => {
                info!("MQTT connection re-established");
                self.update_status(|s| {
                    s.connection_state = ConnectionState::Connected;
                    s.last_error = None;
                    s.reconnect_attempt = 0;
                    s.last_activity = Some(Local::now());
                });
                self.resubscribe().await;
            }
            TransportEvent::GaveUp { reason } => {
                error!(reason = %reason, "MQTT reconnect attempts exhausted");
                self.drop_link();
                self.update_status(|s| {
                    s.connection_state = ConnectionState::Failed;
                    s.last_error = Some(reason);
                    s.reconnect_attempt = 0;
                });
            }
        }
    }

    /// Event stream ended without a prior `GaveUp`.
    fn link_closed(&mut self) {
        warn!("MQTT link closed");
        self.drop_link();
        self.update_status(|s| {
            if s.connection_state != ConnectionState::Failed {
                s.connection_state = ConnectionState::Disconnected;
            }
            s.reconnect_attempt = 0;
        });
    }

    async fn connect(&mut self, requested: Option<Endpoint>) -> Result<(), SyncError> {
        let endpoint = requested.unwrap_or_else(|| self.config.endpoint.clone());

        if self.is_connected() && self.endpoint.as_ref() == Some(&endpoint) {
            debug!(%endpoint, "Already connected");
            return Ok(());
        }

        if let Err(e) = self.teardown().await {
            debug!("Previous link closed uncleanly: {}", e);
        }

        let client_id = self.config.generate_client_id();
        info!(%endpoint, client_id = %client_id, "Connecting to MQTT broker");
        self.update_status(|s| {
            s.connection_state = ConnectionState::Connecting;
            s.endpoint = Some(endpoint.to_string());
            s.client_id = Some(client_id.clone());
            s.reconnect_attempt = 0;
        });

        let opened = match tokio::time::timeout(
            self.config.connect_timeout,
            self.connector.open(&endpoint, &client_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.config.connect_timeout)),
        };

        match opened {
            Ok(link) => {
                self.transport = Some(link.transport);
                self.events = Some(link.events);
                self.endpoint = Some(endpoint);
                self.update_status(|s| {
                    s.connection_state = ConnectionState::Connected;
                    s.last_error = None;
                    s.last_activity = Some(Local::now());
                });
                info!("MQTT connected");
                self.resubscribe().await;
                Ok(())
            }
            Err(e) => {
                error!(%endpoint, "MQTT connect failed: {}", e);
                self.update_status(|s| {
                    s.connection_state = ConnectionState::Failed;
                    s.last_error = Some(e.to_string());
                });
                Err(SyncError::Connection(e))
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), SyncError> {
        let result = self.teardown().await;
        self.update_status(|s| {
            s.connection_state = ConnectionState::Disconnected;
            s.reconnect_attempt = 0;
        });

        match result {
            Ok(()) => {
                info!("MQTT disconnected");
                Ok(())
            }
            Err(e) => {
                warn!("MQTT disconnect was not acknowledged: {}", e);
                Err(SyncError::Connection(e))
            }
        }
    }

    /// Closes and releases the current link, if any. Subscriptions stay
    /// registered as pending.
    async fn teardown(&mut self) -> Result<(), TransportError> {
        self.events = None;
        self.endpoint = None;
        let Some(transport) = self.transport.take() else {
            return Ok(());
        };
        self.registry.suspend();

        let limit = self.config.disconnect_timeout;
        match tokio::time::timeout(limit, transport.disconnect()).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::AckTimeout(limit)),
        }
    }

    fn drop_link(&mut self) {
        self.transport = None;
        self.events = None;
        self.endpoint = None;
        self.registry.suspend();
    }

    async fn resubscribe(&mut self) {
        let pending = self.registry.pending();
        if pending.is_empty() {
            return;
        }

        info!(count = pending.len(), "Subscribing registered topics");
        let outcomes = self.subscribe_topics(pending).await;
        let failed = outcomes.iter().filter(|o| !o.is_ok()).count();
        if failed > 0 {
            warn!(failed, "Some topics could not be subscribed");
        }
    }

    /// Subscribes topic by topic. Once the link is lost the remaining topics
    /// are only registered as pending; the reconnect subscribes them.
    async fn subscribe_topics(&mut self, topics: Vec<String>) -> Vec<TopicOutcome> {
        let mut outcomes = Vec::with_capacity(topics.len());
        let mut link_lost = false;

        for topic in topics {
            if let Err(e) = validate_filter(&topic) {
                outcomes.push(TopicOutcome::err(e));
                continue;
            }
            if !self.registry.begin_subscribe(&topic) {
                outcomes.push(TopicOutcome::ok(topic));
                continue;
            }

            let result = match self.transport.as_ref() {
                Some(transport) if !link_lost => {
                    transport.subscribe(&topic, QoS::AtMostOnce).await
                }
                _ => Err(TransportError::ConnectionLost),
            };
            self.registry.finish_subscribe(&topic, &result);
            if !link_lost && result == Err(TransportError::ConnectionLost) {
                warn!(topic = %topic, "Link lost while subscribing, remaining topics stay pending");
                link_lost = true;
            }

            match result {
                Ok(()) => {
                    debug!(topic = %topic, "Subscribed");
                    outcomes.push(TopicOutcome::ok(topic));
                }
                Err(reason) if link_lost => {
                    debug!(topic = %topic, "Subscribe deferred: {}", reason);
                    outcomes.push(TopicOutcome::err(SubscriptionError::Failed { topic, reason }));
                }
                Err(reason) => {
                    warn!(topic = %topic, "Subscribe failed: {}", reason);
                    outcomes.push(TopicOutcome::err(SubscriptionError::Failed { topic, reason }));
                }
            }
        }
        outcomes
    }

    async fn unsubscribe_topics(&mut self, topics: Vec<String>) -> Vec<TopicOutcome> {
        let mut outcomes = Vec::with_capacity(topics.len());

        for topic in topics {
            // only confirmed subscriptions exist on the broker side
            if self.registry.state(&topic) != Some(SubscriptionState::Active) {
                self.registry.remove(&topic);
                outcomes.push(TopicOutcome::ok(topic));
                continue;
            }

            let result = match self.transport.as_ref() {
                Some(transport) => transport.unsubscribe(&topic).await,
                None => Err(TransportError::ConnectionLost),
            };

            match result {
                Ok(()) => {
                    self.registry.remove(&topic);
                    debug!(topic = %topic, "Unsubscribed");
                    outcomes.push(TopicOutcome::ok(topic));
                }
                Err(reason) => {
                    warn!(topic = %topic, "Unsubscribe failed: {}", reason);
                    outcomes.push(TopicOutcome::err(SubscriptionError::Failed { topic, reason }));
                }
            }
        }
        outcomes
    }

    async fn publish(
        &mut self,
        topic: String,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), SyncError> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        if !is_valid_publish_topic(&topic) {
            return Err(SyncError::InvalidTopic(topic));
        }
        let Some(transport) = self.transport.as_ref() else {
            return Err(SyncError::NotConnected);
        };

        match transport.publish(&topic, payload, options).await {
            Ok(()) => {
                debug!(topic = %topic, "Published");
                self.update_counters(|s| {
                    s.messages_sent += 1;
                    s.last_activity = Some(Local::now());
                });
                Ok(())
            }
            Err(source) => {
                warn!(topic = %topic, "Publish failed: {}", source);
                Err(SyncError::Publish { topic, source })
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.transport.is_some() && self.status.borrow().is_connected()
    }

    fn update_status(&self, f: impl FnOnce(&mut MqttStatus)) {
        self.status.send_modify(f);
    }

    /// Counter updates are visible to `borrow()` but do not wake watchers.
    fn update_counters(&self, f: impl FnOnce(&mut MqttStatus)) {
        self.status.send_if_modified(|s| {
            f(s);
            false
        });
    }
}

/// Cloneable access to the connection manager.
#[derive(Clone)]
pub struct MqttHandle {
    commands: mpsc::Sender<HandlerCommand>,
    status: watch::Receiver<MqttStatus>,
    cache: LastValueCache,
}

impl MqttHandle {
    /// Starts the handler task. Topics in `config.default_topics` are
    /// registered and get subscribed on every connect.
    pub fn spawn(config: MqttConfig, connector: Arc<dyn Connector>) -> (Self, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (status_tx, status_rx) = watch::channel(MqttStatus::default());
        let cache = LastValueCache::new();

        let mut registry = TopicRegistry::new();
        registry.register(&config.default_topics);

        let handler = MqttHandler {
            config,
            connector,
            transport: None,
            events: None,
            endpoint: None,
            registry,
            cache: cache.clone(),
            status: status_tx,
            commands: command_rx,
        };
        let task = tokio::spawn(handler.run());

        let handle = MqttHandle {
            commands: command_tx,
            status: status_rx,
            cache,
        };
        (handle, task)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> HandlerCommand,
    ) -> Result<T, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SyncError::HandlerClosed)?;
        rx.await.map_err(|_| SyncError::HandlerClosed)?
    }

    /// Connects to `endpoint`, or the configured one. No-op when already
    /// connected there.
    pub async fn connect(&self, endpoint: Option<Endpoint>) -> Result<(), SyncError> {
        self.request(|respond_to| HandlerCommand::Connect {
            endpoint,
            respond_to,
        })
        .await
    }

    pub async fn disconnect(&self) -> Result<(), SyncError> {
        self.request(|respond_to| HandlerCommand::Disconnect { respond_to })
            .await
    }

    /// Subscribes each topic and reports per-topic results. Fails as a whole
    /// with [`SyncError::NotConnected`] when there is no live connection.
    pub async fn subscribe<I, S>(&self, topics: I) -> Result<Vec<TopicOutcome>, SyncError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let topics = topics.into_iter().map(Into::into).collect();
        self.request(|respond_to| HandlerCommand::Subscribe { topics, respond_to })
            .await
    }

    pub async fn unsubscribe<I, S>(&self, topics: I) -> Result<Vec<TopicOutcome>, SyncError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let topics = topics.into_iter().map(Into::into).collect();
        self.request(|respond_to| HandlerCommand::Unsubscribe { topics, respond_to })
            .await
    }

    /// At-most-once, not retained.
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(), SyncError> {
        self.publish_with(topic, payload, PublishOptions::default())
            .await
    }

    pub async fn publish_with(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        options: PublishOptions,
    ) -> Result<(), SyncError> {
        let topic = topic.into();
        let payload = payload.into();
        self.request(|respond_to| HandlerCommand::Publish {
            topic,
            payload,
            options,
            respond_to,
        })
        .await
    }

    pub async fn send_command(&self, command: &Command) -> Result<(), SyncError> {
        info!(topic = command.topic(), payload = %command.payload(), "Sending command");
        self.publish(command.topic(), command.payload()).await
    }

    pub async fn subscriptions(&self) -> Result<Vec<Subscription>, SyncError> {
        self.request(|respond_to| HandlerCommand::Subscriptions { respond_to })
            .await
    }

    pub fn status(&self) -> MqttStatus {
        self.status.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().is_connected()
    }

    /// Changes only on state transitions, not on message counters.
    pub fn watch_status(&self) -> watch::Receiver<MqttStatus> {
        self.status.clone()
    }

    pub fn cache(&self) -> &LastValueCache {
        &self.cache
    }
}
