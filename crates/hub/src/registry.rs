//! Authoritative in-process snapshot of every known device, kept in step
//! with the persisted store.
//!
//! All writes go through [`DeviceRegistry::register`] and
//! [`DeviceRegistry::apply_update`]. Each write holds the map's write guard
//! across the store call, so mutations within one process never interleave
//! and a failed store write leaves the map untouched.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::SharedClock;
use crate::device::{
    unix_millis, DataPatch, Device, DeviceId, DeviceKind, DevicePayload, DeviceSpec, DeviceStatus,
};
use crate::store::{DeviceUpdate, SharedStore, StoreError};

/// How many successive millisecond suffixes `register` tries before giving up.
const MAX_ID_ATTEMPTS: i128 = 64;

pub type SharedRegistry = Arc<DeviceRegistry>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("device '{0}' not found")]
    NotFound(DeviceId),
    #[error("device '{id}' is a {actual}, expected a {expected}")]
    WrongDeviceType {
        id: DeviceId,
        expected: DeviceKind,
        actual: DeviceKind,
    },
    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),
}

pub struct DeviceRegistry {
    devices: RwLock<HashMap<DeviceId, Device>>,
    store: SharedStore,
    clock: SharedClock,
}

impl DeviceRegistry {
    pub fn new(store: SharedStore, clock: SharedClock) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            store,
            clock,
        }
    }

    /// Pull every persisted document into the map. Returns how many were
    /// accepted (stale documents are skipped).
    pub async fn load(&self) -> Result<usize, RegistryError> {
        let documents = self.store.load_all().await?;
        let mut accepted = 0;
        for device in documents {
            if self.mirror(device).await {
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    /// Assign an id, persist the record as `offline`, then insert it.
    /// Valve state is normalized and missing reading or action times are
    /// taken from the registry clock.
    pub async fn register(&self, spec: DeviceSpec) -> Result<DeviceId, RegistryError> {
        let mut devices = self.devices.write().await;

        let now = self.clock.now();
        let kind = spec.kind();
        let base = unix_millis(now);
        let payload = spec.payload_at(now);

        let mut device = Device {
            id: DeviceId::with_millis(kind, base),
            name: spec.name,
            location: spec.location,
            status: DeviceStatus::Offline,
            last_update: now,
            payload,
        };

        for offset in 0..MAX_ID_ATTEMPTS {
            device.id = DeviceId::with_millis(kind, base + offset);
            if devices.contains_key(&device.id) {
                continue;
            }
            match self.store.create(&device).await {
                Ok(()) => {
                    info!(device = %device.id, %kind, name = %device.name, "device registered");
                    let id = device.id.clone();
                    devices.insert(id.clone(), device);
                    return Ok(id);
                }
                // Another session took this id but we have not mirrored it yet.
                Err(StoreError::AlreadyExists(_)) => continue,
                Err(e) => {
                    error!(%kind, name = %device.name, "register failed: {e}");
                    return Err(e.into());
                }
            }
        }

        Err(StoreError::AlreadyExists(device.id).into())
    }

    pub async fn get(&self, id: &DeviceId) -> Option<Device> {
        self.devices.read().await.get(id).cloned()
    }

    /// All devices, in no particular order.
    pub async fn list(&self) -> Vec<Device> {
        self.devices.read().await.values().cloned().collect()
    }

    pub async fn list_by_type(&self, kind: DeviceKind) -> Vec<Device> {
        self.devices
            .read()
            .await
            .values()
            .filter(|d| d.kind() == kind)
            .cloned()
            .collect()
    }

    /// Merge `patch` into the payload, set `status` if given, refresh
    /// `lastUpdate`, persist, then update the map.
    pub async fn apply_update(
        &self,
        id: &DeviceId,
        status: Option<DeviceStatus>,
        patch: Option<DataPatch>,
    ) -> Result<Device, RegistryError> {
        let mut devices = self.devices.write().await;
        self.update_locked(&mut devices, id, status, patch).await
    }

    /// Like `apply_update`, but the patch is built from the current payload
    /// under the same guard, so read-modify-write commands never race.
    pub async fn update_with<F>(
        &self,
        id: &DeviceId,
        status: Option<DeviceStatus>,
        build: F,
    ) -> Result<Device, RegistryError>
    where
        F: FnOnce(&DevicePayload) -> DataPatch + Send,
    {
        let mut devices = self.devices.write().await;
        let patch = match devices.get(id) {
            Some(current) => build(&current.payload),
            None => return Err(RegistryError::NotFound(id.clone())),
        };
        self.update_locked(&mut devices, id, status, Some(patch))
            .await
    }

    /// Mark a device offline if it has been silent for longer than
    /// `timeout`. The silence check and the write happen under one guard, so
    /// an update landing between a scan and this call is never overridden.
    pub async fn mark_offline_if_silent(
        &self,
        id: &DeviceId,
        timeout: time::Duration,
    ) -> Result<Option<time::Duration>, RegistryError> {
        let mut devices = self.devices.write().await;
        let device = devices
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;

        let elapsed = self.clock.now() - device.last_update;
        if device.status == DeviceStatus::Offline || elapsed <= timeout {
            return Ok(None);
        }

        self.update_locked(&mut devices, id, Some(DeviceStatus::Offline), None)
            .await?;
        Ok(Some(elapsed))
    }

    async fn update_locked(
        &self,
        devices: &mut HashMap<DeviceId, Device>,
        id: &DeviceId,
        status: Option<DeviceStatus>,
        patch: Option<DataPatch>,
    ) -> Result<Device, RegistryError> {
        let current = devices
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;

        let mut payload = current.payload.clone();
        if let Some(patch) = patch {
            payload
                .apply(patch)
                .map_err(|m| RegistryError::WrongDeviceType {
                    id: id.clone(),
                    expected: m.expected,
                    actual: m.actual,
                })?;
        }

        let update = DeviceUpdate {
            status: status.unwrap_or(current.status),
            last_update: self.clock.now(),
            payload,
        };

        let updated = self.store.merge_update(id, &update).await?;
        debug!(device = %id, status = %updated.status, "device updated");
        devices.insert(id.clone(), updated.clone());
        Ok(updated)
    }

    /// Adopt a record written elsewhere. Last write wins by `lastUpdate`:
    /// a record that is not strictly newer than the local copy is ignored.
    pub async fn mirror(&self, device: Device) -> bool {
        let mut devices = self.devices.write().await;
        if let Some(local) = devices.get(&device.id) {
            if local.last_update >= device.last_update {
                debug!(device = %device.id, "ignoring stale store change");
                return false;
            }
        }
        devices.insert(device.id.clone(), device);
        true
    }

    /// Mirror the store's change feed into the map until `cancel` fires.
    /// Subscribes before returning, so no write made after this call is
    /// missed.
    pub fn spawn_sync(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let mut changes = self.store.subscribe();
        let registry = Arc::clone(self);

        tokio::spawn(async move {
            info!("registry sync started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = changes.recv() => match msg {
                        Ok(change) => {
                            registry.mirror(change.device).await;
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "registry sync lagged; reloading from store");
                            if let Err(e) = registry.load().await {
                                error!("registry reload failed: {e}");
                            }
                        }
                        Err(RecvError::Closed) => {
                            warn!("store change feed closed");
                            break;
                        }
                    },
                }
            }
            info!("registry sync stopped");
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
