use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, Mutex};

use super::{DeviceStore, DeviceUpdate, StoreChange, StoreError, CHANGE_FEED_CAPACITY};
use crate::device::{Device, DeviceId};

/// Process-local store. Nothing survives a restart.
pub struct MemoryStore {
    documents: Mutex<HashMap<DeviceId, Device>>,
    changes: broadcast::Sender<StoreChange>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            documents: Mutex::new(HashMap::new()),
            changes,
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent write fail with `Unavailable` until reset.
    #[cfg(test)]
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn create(&self, device: &Device) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut documents = self.documents.lock().await;
        if documents.contains_key(&device.id) {
            return Err(StoreError::AlreadyExists(device.id.clone()));
        }
        documents.insert(device.id.clone(), device.clone());
        let _ = self.changes.send(StoreChange {
            device: device.clone(),
        });
        Ok(())
    }

    async fn merge_update(
        &self,
        id: &DeviceId,
        update: &DeviceUpdate,
    ) -> Result<Device, StoreError> {
        self.check_writable()?;
        let mut documents = self.documents.lock().await;
        let device = documents
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        update.merge_into(device);
        let merged = device.clone();
        let _ = self.changes.send(StoreChange {
            device: merged.clone(),
        });
        Ok(merged)
    }

    async fn load_all(&self) -> Result<Vec<Device>, StoreError> {
        Ok(self.documents.lock().await.values().cloned().collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
