//! SQLite-backed shared storage.
//!
//! Every process that opens the same database file is a separate context.
//! Writes from other processes are discovered by polling: a watcher task
//! compares the table against the last snapshot this handle saw and announces
//! the difference to local subscribers. The handle's own writes update the
//! snapshot directly, so they are never echoed back.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use ratewise_core::RusqliteErrorExt;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::storage::{
    next_origin, SharedStorage, StorageChange, StorageNotice, StorageResult, StorageSubscription,
    EXTERNAL_ORIGIN,
};

const NOTIFICATION_CAPACITY: usize = 64;

/// Shared storage in a SQLite file.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
    snapshot: Arc<Mutex<HashMap<String, String>>>,
    notices: broadcast::Sender<StorageNotice>,
    origin: u64,
}

impl SqliteStorage {
    /// Open (or create) the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ratewise_core::StorageError::Unavailable(format!(
                        "Failed to create {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(path).map_err(|e| e.into_storage_error())?;
        conn.busy_timeout(Duration::from_secs(2))
            .map_err(|e| e.into_storage_error())?;
        Self::init_schema(&conn)?;

        let snapshot = Self::load_all(&conn)?;
        let (notices, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        tracing::debug!("Opened shared storage at {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            snapshot: Arc::new(Mutex::new(snapshot)),
            notices,
            origin: next_origin(),
        })
    }

    fn init_schema(conn: &Connection) -> StorageResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| e.into_storage_error())
    }

    fn load_all(conn: &Connection) -> StorageResult<HashMap<String, String>> {
        let mut stmt = conn
            .prepare("SELECT key, value FROM kv")
            .map_err(|e| e.into_storage_error())?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(|e| e.into_storage_error())?
            .collect::<Result<HashMap<_, _>, _>>()
            .map_err(|e| e.into_storage_error())?;
        Ok(rows)
    }

    /// Compare the table with the last snapshot and announce what changed.
    ///
    /// Returns the changes found. The watcher calls this periodically; tests
    /// call it directly.
    pub fn poll_changes(&self) -> StorageResult<Vec<StorageChange>> {
        let mut snapshot = self.snapshot.lock();
        let current = Self::load_all(&self.conn.lock())?;

        let mut changes = Vec::new();
        for (key, value) in &current {
            let old_value = snapshot.get(key);
            if old_value != Some(value) {
                changes.push(StorageChange {
                    key: key.clone(),
                    old_value: old_value.cloned(),
                    new_value: Some(value.clone()),
                });
            }
        }
        for (key, value) in snapshot.iter() {
            if !current.contains_key(key) {
                changes.push(StorageChange {
                    key: key.clone(),
                    old_value: Some(value.clone()),
                    new_value: None,
                });
            }
        }
        *snapshot = current;
        drop(snapshot);

        for change in &changes {
            tracing::debug!("External change detected for key {}", change.key);
            let _ = self.notices.send(StorageNotice {
                origin: EXTERNAL_ORIGIN,
                change: change.clone(),
            });
        }
        Ok(changes)
    }

    /// Poll for external changes every `interval` until `cancel` fires.
    pub fn spawn_watcher(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let storage = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Storage watcher stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let this = storage.clone();
                        match tokio::task::spawn_blocking(move || this.poll_changes()).await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => tracing::warn!("Storage poll failed: {}", e),
                            Err(e) => tracing::error!("Storage poll task failed: {}", e),
                        }
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

impl SharedStorage for SqliteStorage {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        self.conn
            .lock()
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, String>(0)
            })
            .optional()
            .map_err(|e| e.into_storage_error())
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let mut snapshot = self.snapshot.lock();
        self.conn
            .lock()
            .execute(
                r#"
                INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE
                    SET value = excluded.value, updated_at = excluded.updated_at
                "#,
                params![key, value, chrono::Utc::now().timestamp_millis()],
            )
            .map_err(|e| e.into_storage_error())?;
        snapshot.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let mut snapshot = self.snapshot.lock();
        self.conn
            .lock()
            .execute("DELETE FROM kv WHERE key = ?1", params![key])
            .map_err(|e| e.into_storage_error())?;
        snapshot.remove(key);
        Ok(())
    }

    fn subscribe(&self) -> StorageSubscription {
        StorageSubscription::new(self.notices.subscribe(), self.origin)
    }
}
