//! Error types for the MQTT synchronization layer

use std::time::Duration;

use thiserror::Error;

/// Failures reported by the messaging client underneath the handler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Handshake failed or the broker refused the connection
    #[error("connect failed: {0}")]
    Connect(String),

    /// Connection attempt did not complete in time
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    /// The link dropped while a request was waiting for its acknowledgment
    #[error("connection lost")]
    ConnectionLost,

    /// The broker answered with a failure code
    #[error("rejected by broker: {0}")]
    Rejected(String),

    /// No acknowledgment arrived in time
    #[error("no acknowledgment after {0:?}")]
    AckTimeout(Duration),

    /// The request could not be handed to the client
    #[error("request failed: {0}")]
    Request(String),
}

/// A single topic failed to subscribe or unsubscribe.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("subscription to '{topic}' failed: {reason}")]
    Failed { topic: String, reason: TransportError },

    #[error("invalid topic '{0}'")]
    InvalidTopic(String),
}

impl SubscriptionError {
    pub fn topic(&self) -> &str {
        match self {
            SubscriptionError::Failed { topic, .. } => topic,
            SubscriptionError::InvalidTopic(topic) => topic,
        }
    }
}

/// Errors returned to callers of [`MqttHandle`](super::mqtt_handler::MqttHandle).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// Publish/subscribe attempted without a live connection. Nothing was sent.
    #[error("not connected to a broker")]
    NotConnected,

    #[error("connection error: {0}")]
    Connection(#[from] TransportError),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error("publish to '{topic}' failed: {source}")]
    Publish {
        topic: String,
        source: TransportError,
    },

    #[error("invalid topic '{0}'")]
    InvalidTopic(String),

    /// The handler task is gone (shut down or panicked)
    #[error("mqtt handler is not running")]
    HandlerClosed,
}
