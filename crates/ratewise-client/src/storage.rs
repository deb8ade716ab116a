//! Shared key/value storage with cross-context change notifications.
//!
//! A storage medium is shared by several *contexts* (client instances, tabs,
//! processes). Every write made through one context is announced to the
//! subscribers of every other context as a [`StorageChange`]; the writing
//! context never hears about its own writes. Delivery is best-effort: a
//! subscriber that falls behind skips the notifications it missed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use ratewise_core::StorageError;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Capacity of each medium's notification channel.
const NOTIFICATION_CAPACITY: usize = 64;

/// Origin used for changes detected from outside the process.
pub(crate) const EXTERNAL_ORIGIN: u64 = 0;

static NEXT_ORIGIN: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_origin() -> u64 {
    NEXT_ORIGIN.fetch_add(1, Ordering::Relaxed)
}

/// A change to one key, as seen by another context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct StorageNotice {
    pub origin: u64,
    pub change: StorageChange,
}

/// Receiving end of a context's change notifications.
#[derive(Debug)]
pub struct StorageSubscription {
    rx: broadcast::Receiver<StorageNotice>,
    origin: u64,
}

impl StorageSubscription {
    pub(crate) fn new(rx: broadcast::Receiver<StorageNotice>, origin: u64) -> Self {
        Self { rx, origin }
    }

    /// Wait for the next change made by another context.
    ///
    /// Returns `None` once the medium has been dropped.
    pub async fn recv(&mut self) -> Option<StorageChange> {
        loop {
            match self.rx.recv().await {
                Ok(notice) if notice.origin == self.origin => continue,
                Ok(notice) => return Some(notice.change),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Storage subscriber lagged, skipped {} notifications", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<StorageChange> {
        loop {
            match self.rx.try_recv() {
                Ok(notice) if notice.origin == self.origin => continue,
                Ok(notice) => return Some(notice.change),
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!("Storage subscriber lagged, skipped {} notifications", skipped);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}

/// A durable key/value medium shared between contexts.
///
/// Implementations must be usable from any thread; each handle is one context.
pub trait SharedStorage: Send + Sync {
    /// Read the value stored under `key`.
    fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Replace the value stored under `key`.
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Remove `key`. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> StorageResult<()>;

    /// Subscribe to changes made by other contexts.
    fn subscribe(&self) -> StorageSubscription;
}

struct Medium {
    entries: Mutex<HashMap<String, String>>,
    notices: broadcast::Sender<StorageNotice>,
    fail_writes: AtomicBool,
}

/// In-process storage medium.
///
/// `MemoryStorage::new()` creates a medium; [`context`](Self::context) opens
/// another context on the same data. Clones are the same context.
#[derive(Clone)]
pub struct MemoryStorage {
    medium: Arc<Medium>,
    origin: u64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        let (notices, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            medium: Arc::new(Medium {
                entries: Mutex::new(HashMap::new()),
                notices,
                fail_writes: AtomicBool::new(false),
            }),
            origin: next_origin(),
        }
    }

    /// Open a new context sharing this medium.
    pub fn context(&self) -> Self {
        Self {
            medium: self.medium.clone(),
            origin: next_origin(),
        }
    }

    /// Make every subsequent write fail as if the quota were exhausted.
    pub fn simulate_write_failures(&self, fail: bool) {
        self.medium.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.medium.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::QuotaExceeded);
        }
        Ok(())
    }

    fn announce(&self, change: StorageChange) {
        // No receivers is fine: nobody is listening yet.
        let _ = self.medium.notices.send(StorageNotice {
            origin: self.origin,
            change,
        });
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

impl SharedStorage for MemoryStorage {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.medium.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.check_writable()?;

        let old_value = {
            let mut entries = self.medium.entries.lock();
            entries.insert(key.to_string(), value.to_string())
        };

        if old_value.as_deref() != Some(value) {
            self.announce(StorageChange {
                key: key.to_string(),
                old_value,
                new_value: Some(value.to_string()),
            });
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        self.check_writable()?;

        let old_value = self.medium.entries.lock().remove(key);
        if old_value.is_some() {
            self.announce(StorageChange {
                key: key.to_string(),
                old_value,
                new_value: None,
            });
        }
        Ok(())
    }

    fn subscribe(&self) -> StorageSubscription {
        StorageSubscription::new(self.medium.notices.subscribe(), self.origin)
    }
}
