//! Health monitor: periodically marks silent devices offline.
//!
//! A device whose `lastUpdate` is older than the timeout and whose status is
//! not already `offline` gets `apply_update(id, offline)`. The monitor never
//! brings a device back online; silence means "unknown", not "healthy".

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::device::{DeviceId, DeviceStatus};
use crate::registry::{RegistryError, SharedRegistry};
use crate::state::SharedState;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_TIMEOUT: time::Duration = time::Duration::seconds(60);

#[derive(Debug, Clone, Copy)]
pub struct HealthOptions {
    /// Time between scans.
    pub interval: Duration,
    /// Silence longer than this marks a device offline.
    pub timeout: time::Duration,
}

impl Default for HealthOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

pub struct HealthMonitor {
    registry: SharedRegistry,
    shared: SharedState,
    options: HealthOptions,
}

impl HealthMonitor {
    pub fn new(registry: SharedRegistry, shared: SharedState, options: HealthOptions) -> Self {
        Self {
            registry,
            shared,
            options,
        }
    }

    /// One tick. Returns the ids marked offline.
    pub async fn scan(&self) -> Vec<DeviceId> {
        let mut marked = Vec::new();

        for device in self.registry.list().await {
            if device.status == DeviceStatus::Offline {
                continue;
            }
            match self
                .registry
                .mark_offline_if_silent(&device.id, self.options.timeout)
                .await
            {
                Ok(Some(silent)) => {
                    info!(
                        device = %device.id,
                        silent_sec = silent.whole_seconds(),
                        "health: device silent, marked offline"
                    );
                    self.shared
                        .write()
                        .await
                        .record_offline(&device.id, silent.whole_seconds());
                    marked.push(device.id);
                }
                Ok(None) => {}
                // Removed between list and mark; nothing to do.
                Err(RegistryError::NotFound(_)) => {}
                Err(e) => {
                    error!(device = %device.id, "health: failed to mark offline: {e}");
                    self.shared
                        .write()
                        .await
                        .record_error(format!("{}: failed to mark offline: {e}", device.id));
                }
            }
        }

        marked
    }

    /// Run until `cancel` fires. Intended to be `tokio::spawn`-ed from main.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.options.interval);

        info!(
            interval_sec = self.options.interval.as_secs(),
            timeout_sec = self.options.timeout.whole_seconds(),
            "health monitor started"
        );
        self.shared.write().await.record_system(format!(
            "health monitor started (interval {}s, timeout {}s)",
            self.options.interval.as_secs(),
            self.options.timeout.whole_seconds()
        ));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let marked = self.scan().await;
                    debug!(marked = marked.len(), "health scan done");
                }
            }
        }

        info!("health monitor stopped");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
