use std::thread;
use tokio::sync::{mpsc, oneshot, watch};
use shared::types::DeviceRecord;
use crate::store::db::{DeviceDb, DeviceUpdate};
use crate::store::{hash, StoreError, StoreResult};

/// Commands sent to the store thread
pub enum StoreCommand {
    GetOrCreate {
        name: String,
        hardware_id: String,
        fields: DeviceUpdate,
        reply: oneshot::Sender<StoreResult<(DeviceRecord, bool)>>,
    },
    Update {
        name: String,
        fields: DeviceUpdate,
        reply: oneshot::Sender<StoreResult<DeviceRecord>>,
    },
    Get(String, oneshot::Sender<StoreResult<Option<DeviceRecord>>>),
    List(oneshot::Sender<StoreResult<Vec<DeviceRecord>>>),
    Shutdown,
}

/// Handle to the device store. The connection lives on one thread, so every
/// read and write is serialized through the command channel.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
}

impl StoreHandle {
    /// Spawn the store thread around an open database
    pub fn spawn(db: DeviceDb, hash_tx: watch::Sender<String>) -> Self {
        let (tx, mut rx) = mpsc::channel::<StoreCommand>(256);

        // Republish the hash after mutations only
        let recompute_hash = |db: &DeviceDb, hash_tx: &watch::Sender<String>| {
            if let Ok(devices) = db.list() {
                hash_tx.send_if_modified(|current| {
                    let new_hash = hash::compute_hash(&devices);
                    if *current == new_hash {
                        return false;
                    }
                    *current = new_hash;
                    true
                });
            }
        };

        thread::spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    StoreCommand::GetOrCreate { name, hardware_id, fields, reply } => {
                        let result = db.get_or_create(&name, &hardware_id, &fields);
                        if result.is_ok() {
                            recompute_hash(&db, &hash_tx);
                        }
                        let _ = reply.send(result);
                    }
                    StoreCommand::Update { name, fields, reply } => {
                        let result = db.update(&name, &fields);
                        if result.is_ok() {
                            recompute_hash(&db, &hash_tx);
                        }
                        let _ = reply.send(result);
                    }
                    // Reads never touch the hash
                    StoreCommand::Get(name, reply) => {
                        let _ = reply.send(db.get(&name));
                    }
                    StoreCommand::List(reply) => {
                        let _ = reply.send(db.list());
                    }
                    StoreCommand::Shutdown => {
                        tracing::info!("Store thread shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    /// Create `name` or fold `fields` into the existing record.
    /// Returns the stored record and whether it was created.
    pub async fn get_or_create(
        &self,
        name: String,
        hardware_id: String,
        fields: DeviceUpdate,
    ) -> StoreResult<(DeviceRecord, bool)> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCommand::GetOrCreate { name, hardware_id, fields, reply }).await?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    /// Partially update an existing device
    pub async fn update(&self, name: String, fields: DeviceUpdate) -> StoreResult<DeviceRecord> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCommand::Update { name, fields, reply }).await?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    /// Get a single device by name
    pub async fn get(&self, name: String) -> StoreResult<Option<DeviceRecord>> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCommand::Get(name, reply)).await?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    /// Get all devices
    pub async fn list(&self) -> StoreResult<Vec<DeviceRecord>> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCommand::List(reply)).await?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    /// Shutdown the store thread
    pub async fn shutdown(&self) -> StoreResult<()> {
        self.send(StoreCommand::Shutdown).await
    }

    async fn send(&self, cmd: StoreCommand) -> StoreResult<()> {
        self.tx.send(cmd).await.map_err(|_| StoreError::Closed)
    }
}
