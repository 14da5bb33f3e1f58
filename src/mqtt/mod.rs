//! # MQTT Synchronization Core
//!
//! Keeps a dashboard in sync with a broker over a single long-lived connection.
//! Inbound publishes for many topics are fanned into one last-value cache;
//! outbound commands are fanned out through the same connection once it is up.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Endpoint, reconnect policy and session settings
//! ├── error.rs            - Transport, subscription and caller-facing errors
//! ├── transport.rs        - Connector/Transport traits the handler depends on
//! ├── rumqtt.rs           - rumqttc implementation of those traits
//! ├── topics.rs           - Topic construction and the subscription registry
//! ├── message_manager.rs  - Last-value cache and update broadcast
//! ├── commands.rs         - Absolute-state commands (relay, pump, payment)
//! └── mqtt_handler.rs     - Connection state machine and the public handle
//! ```
//!
//! ## Ownership
//!
//! - The handler task is the only writer of connection state, subscription state
//!   and the cache. Consumers hold an [`MqttHandle`] and read through it.
//! - Cached values survive disconnects. Staleness is signalled by the connection
//!   state, not per value.
//! - Publish and subscribe are refused with [`SyncError::NotConnected`] unless
//!   the connection is up; nothing reaches the transport in that case.
//! - Subscriptions are registered, not fire-and-forget: every (re)connect
//!   subscribes whatever is registered but not confirmed, exactly once.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kostboard::mqtt::{Command, MqttConfig, MqttHandle, RoomTopics, RumqttConnector, SwitchState};
//!
//! # async fn demo() -> Result<(), kostboard::mqtt::SyncError> {
//! let config = MqttConfig::default();
//! let (mqtt, _task) = MqttHandle::spawn(config.clone(), Arc::new(RumqttConnector::new(config)));
//! mqtt.connect(None).await?;
//!
//! let room = RoomTopics::for_room(1);
//! mqtt.subscribe(room.topics()).await?;
//! let power = mqtt.cache().get(&room.power, "0");
//! mqtt.send_command(&Command::room_power(&room, SwitchState::Off)).await?;
//! # let _ = power;
//! # Ok(())
//! # }
//! ```

pub mod commands;
pub mod config;
pub mod error;
pub mod message_manager;
pub mod mqtt_handler;
pub mod rumqtt;
pub mod topics;
pub mod transport;

pub use commands::{Command, PaymentStatus, SwitchState};
pub use config::{Endpoint, MqttConfig, ReconnectConfig, TransportKind};
pub use error::{SubscriptionError, SyncError, TransportError};
pub use message_manager::{CachedValue, LastValueCache, MqttMessage};
pub use mqtt_handler::{ConnectionState, MqttHandle, MqttStatus};
pub use rumqtt::RumqttConnector;
pub use topics::{
    dashboard_topics, device_topics, RoomTopics, Subscription, SubscriptionState, TopicOutcome,
    TopicRegistry,
};
pub use transport::{Connector, Link, PublishOptions, QoS, Transport, TransportEvent};
