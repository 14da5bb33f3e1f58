//! Application configuration file.
//!
//! Read from `$KOSTBOARD_CONFIG` or `<config dir>/kostboard/config.toml`. A
//! missing file is created with defaults; a malformed one is reported and
//! replaced by defaults in memory (the file is left alone).

use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::mqtt::{dashboard_topics, Endpoint, MqttConfig, ReconnectConfig, RoomTopics, TransportKind};
use crate::persistence::DeviceStore;

const CONFIG_ENV: &str = "KOSTBOARD_CONFIG";
const CONFIG_DIR: &str = "kostboard";
const CONFIG_FILE: &str = "config.toml";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub client: ClientConfig,
    pub reconnect: ReconnectSection,
    pub topics: TopicsConfig,
    pub storage: StorageConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let endpoint = Endpoint::default();
        Self {
            host: endpoint.host,
            port: endpoint.port,
            transport: endpoint.transport,
            path: endpoint.path,
            username: None,
            password: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub client_id_prefix: String,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    pub ack_timeout_secs: u64,
    pub disconnect_timeout_secs: u64,
    /// Bound of the client's request queue
    pub request_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id_prefix: "kostboard-dashboard".to_string(),
            keep_alive_secs: 60,
            connect_timeout_secs: 8,
            ack_timeout_secs: 5,
            disconnect_timeout_secs: 3,
            request_capacity: 64,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ReconnectSection {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    /// Absent: retry forever
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: 5_000,
            max_delay_ms: 30_000,
            backoff_factor: 1.0,
            max_attempts: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TopicsConfig {
    pub dashboard: Vec<String>,
    pub rooms: u8,
    pub subscribe_rooms: bool,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            dashboard: dashboard_topics(),
            rooms: 8,
            subscribe_rooms: true,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub devices_path: Option<PathBuf>,
}

impl AppConfig {
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return PathBuf::from(path);
        }
        let mut path = dirs::config_dir().unwrap_or_else(|| {
            warn!("Could not determine config directory, using current directory");
            PathBuf::from(".")
        });
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    /// Loads the configuration from [`config_path`](Self::config_path).
    pub async fn load() -> Result<Self> {
        let path = Self::config_path();
        Self::ensure_default_config(&path).await?;
        Ok(Self::load_from(&path).await)
    }

    pub async fn ensure_default_config(path: &Path) -> Result<()> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?;
        if !exists {
            info!("Creating default configuration at {}", path.display());
            AppConfig::default().save_to(path).await?;
        }
        Ok(())
    }

    pub async fn load_from(path: &Path) -> Self {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to read config file {}: {}, using defaults", path.display(), e);
                return Self::default();
            }
        };

        match toml::from_str(&content) {
            Ok(config) => {
                debug!("Loaded configuration from {}", path.display());
                config
            }
            Err(e) => {
                warn!("Failed to parse config file {}: {}, using defaults", path.display(), e);
                Self::default()
            }
        }
    }

    pub async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file: {}", e))?;
        Ok(())
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.broker.host.clone(),
            port: self.broker.port,
            transport: self.broker.transport,
            path: self.broker.path.clone(),
        }
    }

    /// Topics subscribed on every connect: dashboard sensors plus the room
    /// topics when enabled.
    pub fn default_topics(&self) -> Vec<String> {
        let mut topics = self.topics.dashboard.clone();
        if self.topics.subscribe_rooms {
            topics.extend(
                RoomTopics::all(self.topics.rooms)
                    .iter()
                    .flat_map(RoomTopics::topics),
            );
        }
        topics
    }

    pub fn mqtt_config(&self) -> MqttConfig {
        let credentials = match (&self.broker.username, &self.broker.password) {
            (Some(user), password) => Some((user.clone(), password.clone().unwrap_or_default())),
            (None, _) => None,
        };

        MqttConfig {
            endpoint: self.endpoint(),
            client_id_prefix: self.client.client_id_prefix.clone(),
            credentials,
            keep_alive: Duration::from_secs(self.client.keep_alive_secs),
            connect_timeout: Duration::from_secs(self.client.connect_timeout_secs),
            ack_timeout: Duration::from_secs(self.client.ack_timeout_secs),
            disconnect_timeout: Duration::from_secs(self.client.disconnect_timeout_secs),
            request_capacity: self.client.request_capacity.max(1),
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(self.reconnect.initial_delay_ms),
                max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
                backoff_factor: self.reconnect.backoff_factor,
                max_attempts: self.reconnect.max_attempts,
            },
            default_topics: self.default_topics(),
        }
    }

    pub fn device_store(&self) -> DeviceStore {
        match &self.storage.devices_path {
            Some(path) => DeviceStore::new(path),
            None => DeviceStore::new(DeviceStore::default_path()),
        }
    }
}
