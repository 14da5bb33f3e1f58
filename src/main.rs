use std::sync::Arc;

use color_eyre::Result;
use kostboard::config::AppConfig;
use kostboard::mqtt::{MqttHandle, RumqttConnector};
use kostboard::persistence::DeviceManager;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = AppConfig::load().await?;
    let mqtt_config = config.mqtt_config();
    info!(
        endpoint = %mqtt_config.endpoint,
        topics = mqtt_config.default_topics.len(),
        "Starting kostboard monitor"
    );

    let connector = Arc::new(RumqttConnector::new(mqtt_config.clone()));
    let (mqtt, mqtt_task) = MqttHandle::spawn(mqtt_config, connector);

    let devices = DeviceManager::spawn(config.device_store(), mqtt.clone());
    let device_client = devices.client();

    // Nachrichten und Statuswechsel protokollieren
    let log_task = tokio::spawn(log_updates(mqtt.clone()));

    // Verbindung fehlgeschlagen ist kein Abbruchgrund, Status bleibt sichtbar
    match mqtt.connect(None).await {
        Ok(()) => match device_client.sync_subscriptions().await {
            Ok(outcomes) => {
                let failed = outcomes.iter().filter(|o| !o.is_ok()).count();
                info!(
                    topics = outcomes.len(),
                    failed, "Device subscriptions synced"
                );
            }
            Err(e) => warn!("Could not sync device subscriptions: {}", e),
        },
        Err(e) => error!("Initial connect failed: {}", e),
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    if let Err(e) = mqtt.disconnect().await {
        warn!("Disconnect failed: {}", e);
    }
    log_task.abort();
    let _ = log_task.await;

    drop(device_client);
    drop(mqtt);
    devices.join().await;
    if let Err(e) = mqtt_task.await {
        error!("MQTT handler ended abnormally: {}", e);
    }

    Ok(())
}

async fn log_updates(mqtt: MqttHandle) {
    let mut updates = mqtt.cache().updates();
    let mut status = mqtt.watch_status();

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(message) => info!("{}", message),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Update log lagging"),
                Err(RecvError::Closed) => break,
            },
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                match &current.last_error {
                    Some(e) => warn!(state = ?current.connection_state, error = %e, "Connection state changed"),
                    None => info!(state = ?current.connection_state, "Connection state changed"),
                }
            }
        }
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
