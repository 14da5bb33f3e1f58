use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{Device, DeviceUpdate, NewDevice, PersistenceError};

const STORE_DIR: &str = "kostboard";
const DEVICES_FILE: &str = "mqtt_devices.toml";

#[derive(Serialize, Deserialize, Default)]
struct DeviceFile {
    #[serde(default)]
    devices: Vec<Device>,
}

/// Device list on disk. Reads the whole file and rewrites it on every change.
#[derive(Debug, Clone)]
pub struct DeviceStore {
    path: PathBuf,
}

impl DeviceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config dir>/kostboard/mqtt_devices.toml`
    pub fn default_path() -> PathBuf {
        let mut path = get_config_dir();
        path.push(STORE_DIR);
        path.push(DEVICES_FILE);
        path
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All devices in stored order. Missing or malformed storage yields an
    /// empty list.
    pub async fn load(&self) -> Vec<Device> {
        match self.read().await {
            Ok(devices) => devices,
            Err(e) => {
                warn!(
                    "Could not read devices from {}, starting empty: {}",
                    self.path.display(),
                    e
                );
                Vec::new()
            }
        }
    }

    async fn read(&self) -> Result<Vec<Device>, PersistenceError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No device file at {}", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        let file: DeviceFile = toml::from_str(&content)?;
        Ok(file.devices)
    }

    /// Current list for a read-modify-write. A malformed file is replaced, but
    /// an unreadable one fails the mutation so stored devices are not lost.
    async fn read_for_update(&self) -> Result<Vec<Device>, PersistenceError> {
        match self.read().await {
            Err(PersistenceError::Parse(e)) => {
                warn!(
                    "Replacing malformed device file {}: {}",
                    self.path.display(),
                    e
                );
                Ok(Vec::new())
            }
            other => other,
        }
    }

    async fn save(&self, devices: Vec<Device>) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = toml::to_string_pretty(&DeviceFile { devices })?;
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Device> {
        self.load().await.into_iter().find(|d| d.id == id)
    }

    pub async fn create(&self, new: NewDevice) -> Result<Device, PersistenceError> {
        new.validate()?;
        let mut devices = self.read_for_update().await?;

        let created_at = Local::now();
        let mut stamp = created_at.timestamp_millis();
        while devices.iter().any(|d| d.id == format!("device_{stamp}")) {
            stamp += 1;
        }

        let device = Device::create(format!("device_{stamp}"), new, created_at);
        devices.push(device.clone());
        self.save(devices).await?;

        info!(id = %device.id, name = %device.name, "Device created");
        Ok(device)
    }

    pub async fn update(&self, id: &str, update: DeviceUpdate) -> Result<Device, PersistenceError> {
        let mut devices = self.read_for_update().await?;
        let slot = devices
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| PersistenceError::NotFound(id.to_string()))?;

        let updated = slot.apply(update)?;
        *slot = updated.clone();
        self.save(devices).await?;

        info!(id = %updated.id, "Device updated");
        Ok(updated)
    }

    /// Removes the device and returns it, `None` if the id is unknown.
    pub async fn delete(&self, id: &str) -> Result<Option<Device>, PersistenceError> {
        let mut devices = self.read_for_update().await?;
        let Some(index) = devices.iter().position(|d| d.id == id) else {
            return Ok(None);
        };

        let removed = devices.remove(index);
        self.save(devices).await?;

        info!(id = %removed.id, "Device deleted");
        Ok(Some(removed))
    }

    pub async fn set_active(&self, id: &str, active: bool) -> Result<Device, PersistenceError> {
        let mut devices = self.read_for_update().await?;
        let slot = devices
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| PersistenceError::NotFound(id.to_string()))?;

        slot.active = active;
        let device = slot.clone();
        self.save(devices).await?;

        debug!(id = %device.id, active, "Device activation saved");
        Ok(device)
    }
}

fn get_config_dir() -> PathBuf {
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."))
}
