#![allow(clippy::unwrap_used)]
// End-to-end behaviour of the MQTT handle against an in-memory broker.

mod common;

use common::{config_with, counts, next_updates, wait_for_state, MockBroker};
use kostboard::mqtt::{
    Command, ConnectionState, Endpoint, MqttConfig, RoomTopics, SubscriptionError,
    SubscriptionState, SwitchState, SyncError, TransportError,
};
use kostboard::persistence::{
    DeviceCategory, DeviceManager, DeviceStore, NewDevice, Pricing,
};

// ── Last-value cache ────────────────────────────────────────────────

#[tokio::test]
async fn unknown_topics_read_as_the_default() {
    let broker = MockBroker::new();
    let mqtt = broker.spawn(config_with(&[]));

    for topic in ["room1/power", "kost/kamar02/water", "never/published"] {
        assert_eq!(mqtt.cache().get(topic, "n/a"), "n/a");
    }
}

#[tokio::test]
async fn received_message_lands_in_the_cache() {
    let broker = MockBroker::new();
    let mqtt = broker.spawn(config_with(&[]));
    let mut updates = mqtt.cache().updates();

    mqtt.connect(None).await.unwrap();
    broker.deliver("room1/power", "120.5");
    next_updates(&mut updates, 1).await;
    assert_eq!(mqtt.cache().get("room1/power", "0"), "120.5");

    // counters are updated after the broadcast; a round trip orders us behind it
    mqtt.subscriptions().await.unwrap();
    assert_eq!(mqtt.status().messages_received, 1);
}

#[tokio::test]
async fn last_write_wins_per_topic() {
    let broker = MockBroker::new();
    let mqtt = broker.spawn(config_with(&[]));
    let mut updates = mqtt.cache().updates();
    mqtt.connect(None).await.unwrap();

    let sequence = [
        ("kost/kamar01/power", "10"),
        ("kost/kamar02/power", "a"),
        ("kost/kamar01/power", "20"),
        ("kost/kamar01/power", "30"),
        ("kost/kamar02/power", "b"),
    ];
    for (topic, payload) in sequence {
        broker.deliver(topic, payload);
    }
    let received = next_updates(&mut updates, sequence.len()).await;

    assert_eq!(mqtt.cache().get("kost/kamar01/power", ""), "30");
    assert_eq!(mqtt.cache().get("kost/kamar02/power", ""), "b");
    let order: Vec<_> = received.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(order, vec!["10", "a", "20", "30", "b"]);
}

#[tokio::test]
async fn cache_survives_disconnect() {
    let broker = MockBroker::new();
    let mqtt = broker.spawn(config_with(&[]));
    let mut updates = mqtt.cache().updates();
    mqtt.connect(None).await.unwrap();

    broker.deliver("sensor/suhu", "28.1");
    next_updates(&mut updates, 1).await;
    mqtt.disconnect().await.unwrap();

    assert!(!mqtt.is_connected());
    assert_eq!(mqtt.cache().get("sensor/suhu", "0"), "28.1");
}

// ── Publish gate ────────────────────────────────────────────────────

#[tokio::test]
async fn publish_without_connection_makes_no_transport_call() {
    let broker = MockBroker::new();
    let mqtt = broker.spawn(config_with(&[]));

    assert_eq!(
        mqtt.publish("room1/relay", "1").await,
        Err(SyncError::NotConnected)
    );
    assert!(broker.publish_calls().is_empty());

    // same after an explicit disconnect
    mqtt.connect(None).await.unwrap();
    mqtt.disconnect().await.unwrap();
    assert_eq!(
        mqtt.publish("room1/relay", "1").await,
        Err(SyncError::NotConnected)
    );
    assert!(broker.publish_calls().is_empty());
    assert_eq!(mqtt.status().messages_sent, 0);
}

#[tokio::test]
async fn publish_without_connection_after_link_loss() {
    let broker = MockBroker::new();
    let mqtt = broker.spawn(config_with(&[]));
    mqtt.connect(None).await.unwrap();

    broker.drop_connection();
    wait_for_state(&mqtt, ConnectionState::Disconnected).await;

    assert_eq!(
        mqtt.publish("room1/relay", "0").await,
        Err(SyncError::NotConnected)
    );
    assert!(broker.publish_calls().is_empty());
}

#[tokio::test]
async fn commands_publish_absolute_state() {
    let broker = MockBroker::new();
    let mqtt = broker.spawn(config_with(&[]));
    mqtt.connect(None).await.unwrap();

    let room = RoomTopics::for_room(1);
    mqtt.send_command(&Command::room_power(&room, SwitchState::Off))
        .await
        .unwrap();
    mqtt.send_command(&Command::room_paid(&room)).await.unwrap();
    mqtt.send_command(&Command::RelayChannel {
        topic: "relay/control".into(),
        channel: 2,
        state: SwitchState::On,
    })
    .await
    .unwrap();

    assert_eq!(
        broker.publish_calls(),
        vec![
            ("kost/kamar01/relay/control".to_string(), "0".to_string()),
            ("kost/kamar01/payment/status".to_string(), "paid".to_string()),
            ("relay/control".to_string(), "2:1".to_string()),
        ]
    );
    assert_eq!(mqtt.status().messages_sent, 3);
}

#[tokio::test]
async fn wildcard_publish_is_rejected() {
    let broker = MockBroker::new();
    let mqtt = broker.spawn(config_with(&[]));
    mqtt.connect(None).await.unwrap();

    assert_eq!(
        mqtt.publish("kost/+/relay", "1").await,
        Err(SyncError::InvalidTopic("kost/+/relay".into()))
    );
    assert!(broker.publish_calls().is_empty());
}

// ── Subscriptions across reconnects ─────────────────────────────────

#[tokio::test]
async fn reconnect_resubscribes_exactly_the_previous_topics() {
    let broker = MockBroker::new();
    let mqtt = broker.spawn(config_with(&[]));

    mqtt.connect(None).await.unwrap();
    mqtt.subscribe(["a", "b"]).await.unwrap();
    assert_eq!(broker.subscribe_calls(), counts(&[("a", 1), ("b", 1)]));

    broker.reset_calls();
    mqtt.disconnect().await.unwrap();
    mqtt.connect(None).await.unwrap();

    assert_eq!(broker.subscribe_calls(), counts(&[("a", 1), ("b", 1)]));
    assert_eq!(broker.connects(), 2);
    assert_eq!(broker.disconnects(), 1);
}

#[tokio::test]
async fn transport_reconnect_resubscribes_once() {
    let broker = MockBroker::new();
    let mqtt = broker.spawn(config_with(&[]));
    mqtt.connect(None).await.unwrap();
    mqtt.subscribe(["a", "b"]).await.unwrap();
    broker.reset_calls();

    broker.drop_connection();
    wait_for_state(&mqtt, ConnectionState::Disconnected).await;
    assert_eq!(
        mqtt.status().last_error.as_deref(),
        Some("keep alive timeout")
    );

    broker.restore_connection();
    wait_for_state(&mqtt, ConnectionState::Connected).await;

    // queued behind the reconnect handling
    let subscriptions = mqtt.subscriptions().await.unwrap();
    assert!(subscriptions
        .iter()
        .all(|s| s.state == SubscriptionState::Active));
    assert_eq!(broker.subscribe_calls(), counts(&[("a", 1), ("b", 1)]));
    assert_eq!(broker.connects(), 1);
}

#[tokio::test]
async fn active_topics_are_not_subscribed_twice() {
    let broker = MockBroker::new();
    let mqtt = broker.spawn(config_with(&[]));
    mqtt.connect(None).await.unwrap();

    mqtt.subscribe(["a"]).await.unwrap();
    let outcomes = mqtt.subscribe(["a", "b"]).await.unwrap();

    assert!(outcomes.iter().all(|o| o.is_ok()));
    assert_eq!(broker.subscribe_calls(), counts(&[("a", 1), ("b", 1)]));
}

#[tokio::test]
async fn default_topics_are_subscribed_on_connect() {
    let broker = MockBroker::new();
    let mqtt = broker.spawn(config_with(&["sensor/suhu", "relay/1"]));

    mqtt.connect(None).await.unwrap();

    assert_eq!(
        broker.subscribe_calls(),
        counts(&[("relay/1", 1), ("sensor/suhu", 1)])
    );
}

#[tokio::test]
async fn subscribe_without_connection_records_nothing() {
    let broker = MockBroker::new();
    let mqtt = broker.spawn(config_with(&[]));

    assert_eq!(mqtt.subscribe(["a"]).await, Err(SyncError::NotConnected));
    mqtt.connect(None).await.unwrap();

    assert!(broker.subscribe_calls().is_empty());
    assert!(mqtt.subscriptions().await.unwrap().is_empty());
}

#[tokio::test]
async fn refused_topic_does_not_affect_others() {
    let broker = MockBroker::new();
    broker.refuse("secret/#");
    let mqtt = broker.spawn(config_with(&[]));
    mqtt.connect(None).await.unwrap();

    let outcomes = mqtt.subscribe(["sensor/cahaya", "secret/#", ""]).await.unwrap();

    assert!(outcomes[0].is_ok());
    assert_eq!(
        outcomes[1].result,
        Err(SubscriptionError::Failed {
            topic: "secret/#".into(),
            reason: TransportError::Rejected("not authorized".into()),
        })
    );
    assert_eq!(
        outcomes[2].result,
        Err(SubscriptionError::InvalidTopic(String::new()))
    );

    // refused topics are not retried on reconnect
    broker.reset_calls();
    mqtt.disconnect().await.unwrap();
    mqtt.connect(None).await.unwrap();
    assert_eq!(broker.subscribe_calls(), counts(&[("sensor/cahaya", 1)]));
}

#[tokio::test]
async fn link_loss_mid_batch_leaves_the_rest_pending() {
    let broker = MockBroker::new();
    broker.lose_link_at("b");
    let mqtt = broker.spawn(config_with(&["a", "b", "c", "d"]));

    mqtt.connect(None).await.unwrap();
    wait_for_state(&mqtt, ConnectionState::Disconnected).await;

    // nothing is attempted after the link went away
    assert_eq!(broker.subscribe_calls(), counts(&[("a", 1), ("b", 1)]));
    let subscriptions = mqtt.subscriptions().await.unwrap();
    assert_eq!(subscriptions.len(), 4);
    assert!(subscriptions
        .iter()
        .all(|s| s.state == SubscriptionState::Pending));

    broker.reset_calls();
    broker.restore_connection();
    wait_for_state(&mqtt, ConnectionState::Connected).await;

    let subscriptions = mqtt.subscriptions().await.unwrap();
    assert!(subscriptions
        .iter()
        .all(|s| s.state == SubscriptionState::Active));
    assert_eq!(
        broker.subscribe_calls(),
        counts(&[("a", 1), ("b", 1), ("c", 1), ("d", 1)])
    );
}

#[tokio::test]
async fn unsubscribe_removes_the_registration() {
    let broker = MockBroker::new();
    let mqtt = broker.spawn(config_with(&[]));
    mqtt.connect(None).await.unwrap();
    mqtt.subscribe(["a", "b"]).await.unwrap();

    let outcomes = mqtt.unsubscribe(["a", "never-subscribed"]).await.unwrap();
    assert!(outcomes.iter().all(|o| o.is_ok()));
    assert_eq!(broker.unsubscribe_calls(), counts(&[("a", 1)]));

    broker.reset_calls();
    mqtt.disconnect().await.unwrap();
    mqtt.connect(None).await.unwrap();
    assert_eq!(broker.subscribe_calls(), counts(&[("b", 1)]));
}

// ── Connection lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn connect_is_idempotent_per_endpoint() {
    let broker = MockBroker::new();
    let mqtt = broker.spawn(config_with(&[]));

    mqtt.connect(None).await.unwrap();
    let first_id = mqtt.status().client_id;
    mqtt.connect(None).await.unwrap();
    assert_eq!(broker.connects(), 1);

    let other = Endpoint::tcp("broker.local", 1883);
    mqtt.connect(Some(other.clone())).await.unwrap();
    assert_eq!(broker.connects(), 2);
    assert_eq!(broker.disconnects(), 1);
    assert_ne!(mqtt.status().client_id, first_id);
    assert_eq!(mqtt.status().endpoint, Some(other.to_string()));
}

#[tokio::test]
async fn failed_connect_gates_requests() {
    let broker = MockBroker::new();
    broker.fail_connects(true);
    let mqtt = broker.spawn(config_with(&["a"]));

    let result = mqtt.connect(None).await;
    assert!(matches!(result, Err(SyncError::Connection(_))));
    assert_eq!(mqtt.status().connection_state, ConnectionState::Failed);
    assert!(mqtt.status().last_error.is_some());
    assert_eq!(mqtt.publish("relay/1", "1").await, Err(SyncError::NotConnected));

    broker.fail_connects(false);
    mqtt.connect(None).await.unwrap();
    assert!(mqtt.status().last_error.is_none());
    assert_eq!(broker.subscribe_calls(), counts(&[("a", 1)]));
}

#[tokio::test(start_paused = true)]
async fn connect_that_never_completes_is_abandoned() {
    let broker = MockBroker::new();
    broker.hang_connects(true);
    let mqtt = broker.spawn(config_with(&["a"]));
    let limit = MqttConfig::default().connect_timeout;

    assert_eq!(
        mqtt.connect(None).await,
        Err(SyncError::Connection(TransportError::Timeout(limit)))
    );
    assert_eq!(mqtt.status().connection_state, ConnectionState::Failed);
    assert!(mqtt.status().last_error.unwrap().contains("timed out"));
    assert_eq!(mqtt.publish("relay/1", "1").await, Err(SyncError::NotConnected));

    broker.hang_connects(false);
    mqtt.connect(None).await.unwrap();
    assert!(mqtt.is_connected());
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_disconnect_still_ends_disconnected() {
    let broker = MockBroker::new();
    broker.hang_disconnects(true);
    let mqtt = broker.spawn(config_with(&[]));
    mqtt.connect(None).await.unwrap();
    let limit = MqttConfig::default().disconnect_timeout;

    assert_eq!(
        mqtt.disconnect().await,
        Err(SyncError::Connection(TransportError::AckTimeout(limit)))
    );
    assert_eq!(mqtt.status().connection_state, ConnectionState::Disconnected);
    assert_eq!(broker.disconnects(), 1);
    assert_eq!(mqtt.publish("relay/1", "1").await, Err(SyncError::NotConnected));

    broker.hang_disconnects(false);
    mqtt.connect(None).await.unwrap();
    assert_eq!(broker.connects(), 2);
}

#[tokio::test]
async fn exhausted_reconnects_end_in_failed() {
    let broker = MockBroker::new();
    let mqtt = broker.spawn(config_with(&[]));
    mqtt.connect(None).await.unwrap();

    broker.drop_connection();
    broker.give_up();
    wait_for_state(&mqtt, ConnectionState::Failed).await;

    assert_eq!(
        mqtt.status().last_error.as_deref(),
        Some("max attempts reached")
    );
    assert_eq!(mqtt.publish("relay/1", "1").await, Err(SyncError::NotConnected));

    // a fresh connect is allowed afterwards
    mqtt.connect(None).await.unwrap();
    assert!(mqtt.is_connected());
}

// ── Devices ─────────────────────────────────────────────────────────

fn water_meter() -> NewDevice {
    NewDevice {
        name: "Meter Air Blok A".into(),
        server: "202.74.74.42".into(),
        port: 8084,
        category: DeviceCategory::Water,
        pricing: Pricing::water(4500.0),
    }
}

#[tokio::test]
async fn water_device_gets_only_water_topics() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MockBroker::new();
    let mqtt = broker.spawn(config_with(&[]));
    let devices = DeviceManager::spawn(DeviceStore::new(dir.path().join("devices.toml")), mqtt);
    let client = devices.client();

    let device = client.create(water_meter()).await.unwrap();

    assert_eq!(
        device.topics,
        vec![format!("{}/flow", device.id), format!("{}/volume", device.id)]
    );
    for energy_leaf in ["voltage", "current", "power", "energy", "pf"] {
        assert!(!device.topics.iter().any(|t| t.ends_with(energy_leaf)));
    }
}

#[tokio::test]
async fn device_activation_follows_the_connection() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MockBroker::new();
    let mqtt = broker.spawn(config_with(&[]));
    let devices = DeviceManager::spawn(
        DeviceStore::new(dir.path().join("devices.toml")),
        mqtt.clone(),
    );
    let client = devices.client();
    let device = client.create(water_meter()).await.unwrap();

    // saved, but nothing subscribed while offline
    let activation = client.set_active(&device.id, true).await.unwrap();
    assert!(activation.device.active);
    assert!(matches!(activation.outcomes, Err(SyncError::NotConnected)));
    assert!(broker.subscribe_calls().is_empty());

    mqtt.connect(None).await.unwrap();
    let outcomes = client.sync_subscriptions().await.unwrap();
    assert_eq!(outcomes.len(), 2);

    let flow = format!("{}/flow", device.id);
    let volume = format!("{}/volume", device.id);
    assert_eq!(
        broker.subscribe_calls(),
        counts(&[(flow.as_str(), 1), (volume.as_str(), 1)])
    );

    assert!(client.delete(&device.id).await.unwrap());
    assert!(!client.delete(&device.id).await.unwrap());
    assert_eq!(broker.unsubscribe_calls().len(), 2);
    assert!(client.list().await.unwrap().is_empty());
}
