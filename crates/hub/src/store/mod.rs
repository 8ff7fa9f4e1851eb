//! Persisted device documents.
//!
//! The registry depends on exactly three capabilities of the backing store:
//! create a document, merge top-level fields into an existing one, and
//! subscribe to change notifications. `load_all` seeds the registry at
//! startup and after a lagged subscription.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::broadcast;

use crate::device::{Device, DeviceId, DevicePayload, DeviceStatus};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Capacity of each store's change feed.
const CHANGE_FEED_CAPACITY: usize = 256;

pub type SharedStore = Arc<dyn DeviceStore>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("device document '{0}' not found")]
    NotFound(DeviceId),
    #[error("device document '{0}' already exists")]
    AlreadyExists(DeviceId),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("invalid device document: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Top-level fields overwritten by a merge-update. Identity, name and
/// location are left as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceUpdate {
    pub status: DeviceStatus,
    pub last_update: OffsetDateTime,
    pub payload: DevicePayload,
}

impl DeviceUpdate {
    pub(crate) fn merge_into(&self, device: &mut Device) {
        device.status = self.status;
        device.last_update = self.last_update;
        device.payload = self.payload.clone();
    }
}

/// A document as it looks after a write, pushed to every subscriber.
#[derive(Debug, Clone)]
pub struct StoreChange {
    pub device: Device,
}

#[async_trait]
pub trait DeviceStore: Send + Sync + 'static {
    /// Fails with `AlreadyExists` if a document with the same id is present.
    async fn create(&self, device: &Device) -> Result<(), StoreError>;

    /// Returns the document as stored after the merge.
    async fn merge_update(
        &self,
        id: &DeviceId,
        update: &DeviceUpdate,
    ) -> Result<Device, StoreError>;

    async fn load_all(&self) -> Result<Vec<Device>, StoreError>;

    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;
}
