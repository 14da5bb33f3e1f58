use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Local};
use tokio::sync::broadcast;

/// Number of updates a slow subscriber may fall behind before it lags.
const UPDATE_CAPACITY: usize = 256;

/// An inbound publish as seen by consumers of the update stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    pub topic: String,
    pub content: String,
    pub timestamp: DateTime<Local>,
}

impl fmt::Display for MqttMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.content.chars().take(32).collect();
        write!(
            f,
            "{} {} - {}",
            self.timestamp.format("%H:%M:%S"),
            self.topic,
            preview
        )
    }
}

impl MqttMessage {
    pub fn from_topic(topic: String, content: String) -> Self {
        MqttMessage {
            topic,
            content,
            timestamp: Local::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedValue {
    pub payload: String,
    pub received_at: DateTime<Local>,
}

/// Most recent payload per topic.
///
/// Cloning yields another handle to the same store. Only the MQTT handler
/// writes; every write overwrites unconditionally and is broadcast to
/// [`updates`](Self::updates) subscribers. Entries never expire and survive
/// disconnects.
#[derive(Debug, Clone)]
pub struct LastValueCache {
    values: Arc<RwLock<HashMap<String, CachedValue>>>,
    updates: broadcast::Sender<MqttMessage>,
}

impl Default for LastValueCache {
    fn default() -> Self {
        Self::new()
    }
}

impl LastValueCache {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        Self {
            values: Arc::new(RwLock::new(HashMap::new())),
            updates,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, CachedValue>> {
        self.values.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, CachedValue>> {
        self.values.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached payload of `topic`, or `default` if nothing arrived yet.
    pub fn get(&self, topic: &str, default: &str) -> String {
        self.read()
            .get(topic)
            .map(|v| v.payload.clone())
            .unwrap_or_else(|| default.to_string())
    }

    pub fn entry(&self, topic: &str) -> Option<CachedValue> {
        self.read().get(topic).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, CachedValue> {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Stream of every write, in arrival order.
    pub fn updates(&self) -> broadcast::Receiver<MqttMessage> {
        self.updates.subscribe()
    }

    pub(crate) fn record(&self, topic: &str, payload: &[u8]) -> MqttMessage {
        let message = MqttMessage::from_topic(
            topic.to_string(),
            String::from_utf8_lossy(payload).into_owned(),
        );

        self.write().insert(
            message.topic.clone(),
            CachedValue {
                payload: message.content.clone(),
                received_at: message.timestamp,
            },
        );

        // no receivers is fine
        let _ = self.updates.send(message.clone());
        message
    }
}
