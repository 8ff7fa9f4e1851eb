use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{DeviceStore, DeviceUpdate, StoreChange, StoreError, CHANGE_FEED_CAPACITY};
use crate::device::{Device, DeviceId};

/// Document-per-device store on sqlite. Clones share the pool and the
/// change feed.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    changes: broadcast::Sender<StoreChange>,
}

impl SqliteStore {
    /// db_url examples:
    /// - "sqlite:/var/lib/farm-hub/devices.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(db_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every pooled connection to ":memory:" would open its own database.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Ok(Self { pool, changes })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Poll for documents written through other connections (another hub
    /// process, a second pool) and publish them on the change feed.
    ///
    /// The cursor starts at the newest revision present when this is called.
    /// Writes made through this store are published a second time;
    /// subscribers drop them as not newer than what they hold.
    pub async fn watch(
        &self,
        every: Duration,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>, StoreError> {
        let mut cursor = self.latest_revision().await?;
        let store = self.clone();

        Ok(tokio::spawn(async move {
            info!(every_ms = every.as_millis() as u64, "store watch started");
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match store.changed_since(cursor).await {
                    Ok(changed) => {
                        for (revision, device) in changed {
                            debug!(device = %device.id, revision, "store change observed");
                            cursor = cursor.max(revision);
                            store.publish(device);
                        }
                    }
                    Err(e) => warn!("store watch poll failed: {e}"),
                }
            }
            info!("store watch stopped");
        }))
    }

    async fn latest_revision(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COALESCE(MAX(revision), 0) AS revision FROM device_documents")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("revision")?)
    }

    async fn changed_since(&self, revision: i64) -> Result<Vec<(i64, Device)>, StoreError> {
        let rows = sqlx::query(
            "SELECT revision, doc FROM device_documents WHERE revision > ? ORDER BY revision",
        )
        .bind(revision)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<(i64, Device), StoreError> {
                let doc: String = row.try_get("doc")?;
                Ok((row.try_get("revision")?, serde_json::from_str(&doc)?))
            })
            .collect()
    }

    fn publish(&self, device: Device) {
        // No subscribers is fine.
        let _ = self.changes.send(StoreChange { device });
    }
}

fn updated_at(device: &Device) -> String {
    device
        .last_update
        .format(&Rfc3339)
        .unwrap_or_else(|_| device.last_update.unix_timestamp().to_string())
}

#[async_trait]
impl DeviceStore for SqliteStore {
    async fn create(&self, device: &Device) -> Result<(), StoreError> {
        let doc = serde_json::to_string(device)?;
        let result = sqlx::query(
            r#"
            INSERT INTO device_documents (id, doc, updated_at, revision)
            VALUES (?, ?, ?, (SELECT COALESCE(MAX(revision), 0) + 1 FROM device_documents))
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(device.id.as_str())
        .bind(doc)
        .bind(updated_at(device))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(device.id.clone()));
        }

        self.publish(device.clone());
        Ok(())
    }

    async fn merge_update(
        &self,
        id: &DeviceId,
        update: &DeviceUpdate,
    ) -> Result<Device, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT doc FROM device_documents WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        let doc: String = row.try_get("doc")?;
        let mut device: Device = serde_json::from_str(&doc)?;
        update.merge_into(&mut device);

        sqlx::query(
            r#"
            UPDATE device_documents
            SET doc = ?,
                updated_at = ?,
                revision = (SELECT MAX(revision) + 1 FROM device_documents)
            WHERE id = ?
            "#,
        )
            .bind(serde_json::to_string(&device)?)
            .bind(updated_at(&device))
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        self.publish(device.clone());
        Ok(device)
    }

    async fn load_all(&self) -> Result<Vec<Device>, StoreError> {
        let rows = sqlx::query("SELECT doc FROM device_documents ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<Device, StoreError> {
                let doc: String = row.try_get("doc")?;
                Ok(serde_json::from_str(&doc)?)
            })
            .collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

/// A database file under the temp dir, removed on drop.
#[cfg(test)]
pub(crate) struct TempDb {
    pub url: String,
    path: std::path::PathBuf,
}

#[cfg(test)]
impl TempDb {
    pub fn new(name: &str) -> Self {
        let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
        let path = std::env::temp_dir().join(format!(
            "farm-hub-{name}-{}-{nanos}.db",
            std::process::id()
        ));
        Self {
            url: format!("sqlite:{}?mode=rwc", path.display()),
            path,
        }
    }

    /// A migrated store with its own pool on this file.
    pub async fn open(&self) -> SqliteStore {
        let store = SqliteStore::connect(&self.url).await.unwrap();
        store.migrate().await.unwrap();
        store
    }
}

#[cfg(test)]
impl Drop for TempDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let mut file = self.path.clone().into_os_string();
            file.push(suffix);
            let _ = std::fs::remove_file(file);
        }
    }
}
