//! Topic construction and the subscription registry.
//!
//! Every topic string the dashboard uses is built here. The [`TopicRegistry`]
//! records which topics are wanted and how far each subscription got; the
//! handler consults it before touching the transport and reports results back.

use std::collections::BTreeMap;

use serde::Serialize;

use super::error::{SubscriptionError, TransportError};
use super::transport::QoS;
use crate::persistence::DeviceCategory;

/// Static topics of the overview page.
pub fn dashboard_topics() -> Vec<String> {
    [
        "sensor/parking",
        "sensor/suhu",
        "sensor/kelembaban",
        "sensor/cahaya",
        "sensor/waterlevel",
        "relay/1",
        "relay/2",
        "relay/control",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Topic set of one rented room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomTopics {
    pub room: u8,
    pub voltage: String,
    pub current: String,
    pub power: String,
    pub power_factor: String,
    pub energy: String,
    pub cost: String,
    pub temperature: String,
    pub humidity: String,
    pub water: String,
    pub relay_control: String,
    pub payment_status: String,
}

impl RoomTopics {
    pub fn for_room(room: u8) -> Self {
        let base = format!("kost/kamar{room:02}");
        let topic = |leaf: &str| format!("{base}/{leaf}");
        Self {
            room,
            voltage: topic("voltage"),
            current: topic("current"),
            power: topic("power"),
            power_factor: topic("power_factor"),
            energy: topic("energy"),
            cost: topic("cost"),
            temperature: topic("temperature"),
            humidity: topic("humidity"),
            water: topic("water"),
            relay_control: topic("relay/control"),
            payment_status: topic("payment/status"),
        }
    }

    /// Rooms `1..=count`.
    pub fn all(count: u8) -> Vec<Self> {
        (1..=count).map(Self::for_room).collect()
    }

    pub fn topics(&self) -> Vec<String> {
        vec![
            self.voltage.clone(),
            self.current.clone(),
            self.power.clone(),
            self.power_factor.clone(),
            self.energy.clone(),
            self.cost.clone(),
            self.temperature.clone(),
            self.humidity.clone(),
            self.water.clone(),
            self.relay_control.clone(),
            self.payment_status.clone(),
        ]
    }
}

/// Topics a configured device publishes on, derived from its id.
pub fn device_topics(device_id: &str, category: DeviceCategory) -> Vec<String> {
    let leaves: &[&str] = match category {
        DeviceCategory::Energy => &["voltage", "current", "power", "energy", "pf"],
        DeviceCategory::Water => &["flow", "volume"],
    };
    leaves
        .iter()
        .map(|leaf| format!("{device_id}/{leaf}"))
        .collect()
}

/// Checks a subscription filter: non-empty, `+` only as a whole level and
/// `#` only as the whole last level.
pub fn validate_filter(filter: &str) -> Result<(), SubscriptionError> {
    let invalid = || SubscriptionError::InvalidTopic(filter.to_string());
    if filter.is_empty() || filter.contains('\0') {
        return Err(invalid());
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != last) {
            return Err(invalid());
        }
        if level.contains('+') && *level != "+" {
            return Err(invalid());
        }
    }
    Ok(())
}

/// Publish topics must be concrete.
pub fn is_valid_publish_topic(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(['+', '#', '\0'])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SubscriptionState {
    /// Wanted, not (or no longer) confirmed by the broker
    Pending,
    Active,
    /// Broker refused; not retried until asked again
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub topic: String,
    #[serde(skip)]
    pub qos: QoS,
    pub state: SubscriptionState,
    pub last_error: Option<String>,
}

impl Subscription {
    fn pending(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            qos: QoS::AtMostOnce,
            state: SubscriptionState::Pending,
            last_error: None,
        }
    }
}

/// Result of subscribing or unsubscribing a single topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicOutcome {
    pub topic: String,
    pub result: Result<(), SubscriptionError>,
}

impl TopicOutcome {
    pub fn ok(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            result: Ok(()),
        }
    }

    pub fn err(error: SubscriptionError) -> Self {
        Self {
            topic: error.topic().to_string(),
            result: Err(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Wanted topics and their subscription state, owned by the handler.
#[derive(Debug, Default)]
pub struct TopicRegistry {
    entries: BTreeMap<String, Subscription>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers topics as pending without touching existing entries.
    pub fn register<I, S>(&mut self, topics: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for topic in topics {
            let topic = topic.as_ref();
            self.entries
                .entry(topic.to_string())
                .or_insert_with(|| Subscription::pending(topic));
        }
    }

    /// Marks the topic wanted. Returns `false` when it is already active and
    /// no subscribe call is needed.
    pub fn begin_subscribe(&mut self, topic: &str) -> bool {
        let entry = self
            .entries
            .entry(topic.to_string())
            .or_insert_with(|| Subscription::pending(topic));

        match entry.state {
            SubscriptionState::Active => false,
            SubscriptionState::Pending | SubscriptionState::Failed => {
                entry.state = SubscriptionState::Pending;
                true
            }
        }
    }

    /// Records the broker's answer to a subscribe call.
    ///
    /// A call cut short by connection loss leaves the topic pending so the
    /// next connect picks it up again.
    pub fn finish_subscribe(&mut self, topic: &str, result: &Result<(), TransportError>) {
        let Some(entry) = self.entries.get_mut(topic) else {
            return;
        };
        match result {
            Ok(()) => {
                entry.state = SubscriptionState::Active;
                entry.last_error = None;
            }
            Err(TransportError::ConnectionLost) => {
                entry.state = SubscriptionState::Pending;
                entry.last_error = Some(TransportError::ConnectionLost.to_string());
            }
            Err(e) => {
                entry.state = SubscriptionState::Failed;
                entry.last_error = Some(e.to_string());
            }
        }
    }

    pub fn remove(&mut self, topic: &str) -> Option<Subscription> {
        self.entries.remove(topic)
    }

    /// The link went away: nothing is confirmed anymore.
    pub fn suspend(&mut self) {
        for entry in self.entries.values_mut() {
            if entry.state == SubscriptionState::Active {
                entry.state = SubscriptionState::Pending;
            }
        }
    }

    /// Topics a fresh connection has to subscribe.
    pub fn pending(&self) -> Vec<String> {
        self.entries
            .values()
            .filter(|s| s.state == SubscriptionState::Pending)
            .map(|s| s.topic.clone())
            .collect()
    }

    pub fn state(&self, topic: &str) -> Option<SubscriptionState> {
        self.entries.get(topic).map(|s| s.state)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.entries.contains_key(topic)
    }

    pub fn snapshot(&self) -> Vec<Subscription> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
