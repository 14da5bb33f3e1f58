//! # Persistence Module
//!
//! Device configuration owned by the presentation layer. Each configured meter
//! gets its own broker address, pricing and a generated topic set; activating a
//! device subscribes those topics through the MQTT handle.
//!
//! ## Storage
//! All devices live in one TOML file under a single `devices` key. Every
//! mutation reads the whole list and rewrites it, so there is no partial update
//! and no schema versioning. A missing or unreadable file means "no devices".
//!
//! ## Layout
//! ```text
//! persistence/
//! ├── mod.rs                 - Device model and validation
//! ├── device_store.rs        - File access (full read / full rewrite)
//! └── persistence_worker.rs  - Worker task serializing store access, topic sync
//! ```

pub mod device_store;
pub mod persistence_worker;

use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mqtt::device_topics;

pub use device_store::DeviceStore;
pub use persistence_worker::{DeviceActivation, DeviceClient, DeviceManager};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("storage io failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed device file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize devices: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("device '{0}' not found")]
    NotFound(String),

    /// Rejected by validation, nothing was written
    #[error("invalid device: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceCategory {
    Energy,
    Water,
}

impl fmt::Display for DeviceCategory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DeviceCategory::Energy => write!(f, "energy"),
            DeviceCategory::Water => write!(f, "water"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_kwh: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_cubic_meter: Option<f64>,
}

impl Pricing {
    pub fn energy(per_kwh: f64) -> Self {
        Self {
            per_kwh: Some(per_kwh),
            per_cubic_meter: None,
        }
    }

    pub fn water(per_cubic_meter: f64) -> Self {
        Self {
            per_kwh: None,
            per_cubic_meter: Some(per_cubic_meter),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    /// Broker host of this device
    pub server: String,
    pub port: u16,
    pub category: DeviceCategory,
    pub topics: Vec<String>,
    pub active: bool,
    pub created_at: DateTime<Local>,
    #[serde(default)]
    pub pricing: Pricing,
}

/// Form input for a new device.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDevice {
    pub name: String,
    pub server: String,
    pub port: u16,
    pub category: DeviceCategory,
    pub pricing: Pricing,
}

impl NewDevice {
    pub fn validate(&self) -> Result<(), PersistenceError> {
        validate_fields(
            &self.name,
            &self.server,
            self.port,
            self.category,
            &self.pricing,
        )
    }
}

/// Partial edit; `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceUpdate {
    pub name: Option<String>,
    pub server: Option<String>,
    pub port: Option<u16>,
    pub category: Option<DeviceCategory>,
    pub pricing: Option<Pricing>,
}

fn validate_fields(
    name: &str,
    server: &str,
    port: u16,
    category: DeviceCategory,
    pricing: &Pricing,
) -> Result<(), PersistenceError> {
    if name.trim().is_empty() {
        return Err(PersistenceError::Invalid("name is required".into()));
    }
    if server.trim().is_empty() {
        return Err(PersistenceError::Invalid("server is required".into()));
    }
    if port == 0 {
        return Err(PersistenceError::Invalid("port must be non-zero".into()));
    }

    let price = match category {
        DeviceCategory::Energy => pricing.per_kwh.ok_or_else(|| {
            PersistenceError::Invalid("energy meters need a price per kWh".into())
        })?,
        DeviceCategory::Water => pricing.per_cubic_meter.ok_or_else(|| {
            PersistenceError::Invalid("water meters need a price per cubic meter".into())
        })?,
    };
    if !price.is_finite() || price < 0.0 {
        return Err(PersistenceError::Invalid(format!(
            "price must be a non-negative number, got {price}"
        )));
    }
    Ok(())
}

impl Device {
    /// Builds an inactive device with generated topics.
    pub fn create(id: String, new: NewDevice, created_at: DateTime<Local>) -> Self {
        let topics = device_topics(&id, new.category);
        Self {
            id,
            name: new.name.trim().to_string(),
            server: new.server.trim().to_string(),
            port: new.port,
            category: new.category,
            topics,
            active: false,
            created_at,
            pricing: new.pricing,
        }
    }

    /// Applies an edit. The id never changes; a category change regenerates
    /// the topic set.
    pub fn apply(&self, update: DeviceUpdate) -> Result<Device, PersistenceError> {
        let mut device = self.clone();
        if let Some(name) = update.name {
            device.name = name.trim().to_string();
        }
        if let Some(server) = update.server {
            device.server = server.trim().to_string();
        }
        if let Some(port) = update.port {
            device.port = port;
        }
        if let Some(pricing) = update.pricing {
            device.pricing = pricing;
        }
        if let Some(category) = update.category {
            if category != device.category {
                device.category = category;
                device.topics = device_topics(&device.id, category);
            }
        }

        validate_fields(
            &device.name,
            &device.server,
            device.port,
            device.category,
            &device.pricing,
        )?;
        Ok(device)
    }
}
