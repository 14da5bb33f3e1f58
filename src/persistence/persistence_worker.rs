use color_eyre::{eyre::eyre, Result};
use tokio::sync::mpsc::{channel, Sender};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::{Device, DeviceStore, DeviceUpdate, NewDevice};
use crate::mqtt::{MqttHandle, SyncError, TopicOutcome};

macro_rules! handle_action {
    ($action:expr, $response_tx:expr) => {
        if let Err(_) = $response_tx.send($action.await) {
            error!("Failed to send response");
        }
    };
}

/// A saved activation change and what happened to the device's topics.
///
/// The flag is persisted even when the topic sync fails, e.g. with
/// [`SyncError::NotConnected`]; [`DeviceClient::sync_subscriptions`] picks the
/// device up after the next connect.
#[derive(Debug)]
pub struct DeviceActivation {
    pub device: Device,
    pub outcomes: std::result::Result<Vec<TopicOutcome>, SyncError>,
}

// Aktion-Enum für den Device-Worker
#[derive(Debug)]
enum DeviceAction {
    List {
        response_tx: oneshot::Sender<Result<Vec<Device>>>,
    },
    Get {
        id: String,
        response_tx: oneshot::Sender<Result<Option<Device>>>,
    },
    Create {
        device: NewDevice,
        response_tx: oneshot::Sender<Result<Device>>,
    },
    Update {
        id: String,
        update: DeviceUpdate,
        response_tx: oneshot::Sender<Result<Device>>,
    },
    Delete {
        id: String,
        response_tx: oneshot::Sender<Result<bool>>,
    },
    SetActive {
        id: String,
        active: bool,
        response_tx: oneshot::Sender<Result<DeviceActivation>>,
    },
    SyncSubscriptions {
        response_tx: oneshot::Sender<Result<Vec<TopicOutcome>>>,
    },
}

/// Runs the device worker. All store access goes through this one task, so the
/// read-modify-write cycles of the store never interleave.
pub struct DeviceManager {
    tx: Sender<DeviceAction>,
    worker_handle: tokio::task::JoinHandle<()>,
}

impl DeviceManager {
    pub fn spawn(store: DeviceStore, mqtt: MqttHandle) -> Self {
        let (tx, mut rx) = channel::<DeviceAction>(32);
        info!("Device store at {}", store.path().display());

        let worker = DeviceWorker { store, mqtt };
        let handle = tokio::spawn(async move {
            while let Some(action) = rx.recv().await {
                match action {
                    DeviceAction::List { response_tx } => {
                        handle_action!(worker.list(), response_tx);
                    }
                    DeviceAction::Get { id, response_tx } => {
                        handle_action!(worker.get(&id), response_tx);
                    }
                    DeviceAction::Create {
                        device,
                        response_tx,
                    } => {
                        handle_action!(worker.create(device), response_tx);
                    }
                    DeviceAction::Update {
                        id,
                        update,
                        response_tx,
                    } => {
                        handle_action!(worker.update(&id, update), response_tx);
                    }
                    DeviceAction::Delete { id, response_tx } => {
                        handle_action!(worker.delete(&id), response_tx);
                    }
                    DeviceAction::SetActive {
                        id,
                        active,
                        response_tx,
                    } => {
                        handle_action!(worker.set_active(&id, active), response_tx);
                    }
                    DeviceAction::SyncSubscriptions { response_tx } => {
                        handle_action!(worker.sync_subscriptions(), response_tx);
                    }
                }
            }
            debug!("Device worker stopped");
        });

        Self {
            tx,
            worker_handle: handle,
        }
    }

    pub fn client(&self) -> DeviceClient {
        DeviceClient {
            tx: self.tx.clone(),
        }
    }

    /// Waits for the worker after all clients are gone.
    pub async fn join(self) {
        let DeviceManager { tx, worker_handle } = self;
        drop(tx);
        if let Err(e) = worker_handle.await {
            error!("Device worker ended abnormally: {}", e);
        }
    }
}

struct DeviceWorker {
    store: DeviceStore,
    mqtt: MqttHandle,
}

impl DeviceWorker {
    async fn list(&self) -> Result<Vec<Device>> {
        Ok(self.store.load().await)
    }

    async fn get(&self, id: &str) -> Result<Option<Device>> {
        Ok(self.store.get(id).await)
    }

    async fn create(&self, device: NewDevice) -> Result<Device> {
        Ok(self.store.create(device).await?)
    }

    async fn update(&self, id: &str, update: DeviceUpdate) -> Result<Device> {
        let previous = self
            .store
            .get(id)
            .await
            .ok_or_else(|| eyre!("Device '{}' not found", id))?;
        let updated = self.store.update(id, update).await?;

        if updated.active && updated.topics != previous.topics {
            info!(id = %updated.id, "Topic set changed, resyncing subscriptions");
            self.release_topics(&previous).await;
            self.claim_topics(&updated).await;
        }
        Ok(updated)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        match self.store.delete(id).await? {
            Some(device) => {
                if device.active {
                    self.release_topics(&device).await;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_active(&self, id: &str, active: bool) -> Result<DeviceActivation> {
        let device = self.store.set_active(id, active).await?;
        let outcomes = if active {
            self.mqtt.subscribe(device.topics.clone()).await
        } else {
            self.mqtt.unsubscribe(device.topics.clone()).await
        };

        if let Err(e) = &outcomes {
            warn!(id = %device.id, active, "Device saved but topics not synced: {}", e);
        }
        Ok(DeviceActivation { device, outcomes })
    }

    async fn sync_subscriptions(&self) -> Result<Vec<TopicOutcome>> {
        let topics: Vec<String> = self
            .store
            .load()
            .await
            .into_iter()
            .filter(|d| d.active)
            .flat_map(|d| d.topics)
            .collect();

        if topics.is_empty() {
            debug!("No active devices to subscribe");
            return Ok(Vec::new());
        }

        info!(count = topics.len(), "Subscribing active device topics");
        Ok(self.mqtt.subscribe(topics).await?)
    }

    async fn claim_topics(&self, device: &Device) {
        if let Err(e) = self.mqtt.subscribe(device.topics.clone()).await {
            warn!(id = %device.id, "Could not subscribe device topics: {}", e);
        }
    }

    async fn release_topics(&self, device: &Device) {
        if let Err(e) = self.mqtt.unsubscribe(device.topics.clone()).await {
            warn!(id = %device.id, "Could not unsubscribe device topics: {}", e);
        }
    }
}

/// Cloneable request side of the device worker.
#[derive(Clone)]
pub struct DeviceClient {
    tx: Sender<DeviceAction>,
}

impl DeviceClient {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> DeviceAction,
    ) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(make(response_tx))
            .await
            .map_err(|e| eyre!("Device worker unavailable: {}", e))?;
        response_rx
            .await
            .map_err(|e| eyre!("Device worker dropped the request: {}", e))?
    }

    pub async fn list(&self) -> Result<Vec<Device>> {
        self.request(|response_tx| DeviceAction::List { response_tx })
            .await
    }

    pub async fn get(&self, id: impl Into<String>) -> Result<Option<Device>> {
        let id = id.into();
        self.request(|response_tx| DeviceAction::Get { id, response_tx })
            .await
    }

    pub async fn create(&self, device: NewDevice) -> Result<Device> {
        self.request(|response_tx| DeviceAction::Create {
            device,
            response_tx,
        })
        .await
    }

    pub async fn update(&self, id: impl Into<String>, update: DeviceUpdate) -> Result<Device> {
        let id = id.into();
        self.request(|response_tx| DeviceAction::Update {
            id,
            update,
            response_tx,
        })
        .await
    }

    /// `false` if no device had that id.
    pub async fn delete(&self, id: impl Into<String>) -> Result<bool> {
        let id = id.into();
        self.request(|response_tx| DeviceAction::Delete { id, response_tx })
            .await
    }

    pub async fn set_active(&self, id: impl Into<String>, active: bool) -> Result<DeviceActivation> {
        let id = id.into();
        self.request(|response_tx| DeviceAction::SetActive {
            id,
            active,
            response_tx,
        })
        .await
    }

    /// Subscribes the topics of every active device.
    pub async fn sync_subscriptions(&self) -> Result<Vec<TopicOutcome>> {
        self.request(|response_tx| DeviceAction::SyncSubscriptions { response_tx })
            .await
    }
}
