//! Seam between the handler and the messaging client.
//!
//! The handler never talks to a concrete MQTT library. It opens a [`Link`]
//! through a [`Connector`], issues requests through the link's [`Transport`]
//! and consumes the link's [`TransportEvent`] stream. The production
//! implementation lives in [`super::rumqtt`]; tests plug in their own.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::config::Endpoint;
use super::error::TransportError;

/// Delivery guarantee for a subscription or a publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub qos: QoS,
    pub retain: bool,
}

/// Lifecycle and data events emitted by an open link.
///
/// The initial handshake is not reported here; [`Connector::open`] only
/// returns once it succeeded. A closed event channel means the link is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message { topic: String, payload: Vec<u8> },
    /// An established connection dropped unexpectedly
    Lost { reason: String },
    Reconnecting { attempt: u32 },
    /// The client re-established the connection on its own. Broker-side
    /// subscriptions did not survive.
    Reconnected,
    /// The reconnect policy ran out of attempts; no further events follow
    GaveUp { reason: String },
}

/// Request side of an open connection.
///
/// Every call resolves once the broker acknowledged the request (QoS 0
/// publishes resolve when handed to the client).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), TransportError>;

    /// Graceful close. Waits for the client to flush the disconnect.
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// An open connection: the request half plus its event stream.
pub struct Link {
    pub transport: Box<dyn Transport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens links to a broker.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Resolves after a successful handshake, or with the reason it failed.
    async fn open(&self, endpoint: &Endpoint, client_id: &str) -> Result<Link, TransportError>;
}
