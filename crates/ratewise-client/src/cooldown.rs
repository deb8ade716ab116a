//! Durable, shared record of the global rate-limit cooldown.
//!
//! One record lives under a single storage key (`rateLimitCooldown` unless
//! configured otherwise) and is visible to every context sharing the storage
//! medium. Records are JSON:
//!
//! ```json
//! {"expiresAt":"2026-01-01T12:00:45.000Z","retryAfter":45,"timestamp":1767268800000}
//! ```
//!
//! Expired and malformed records are treated as absent and deleted on read.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use ratewise_core::config::{DEFAULT_STORAGE_KEY, MAX_RETRY_AFTER_SECS};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::clock::{Clock, SystemClock};
use crate::storage::{SharedStorage, StorageSubscription};

/// A persisted cooldown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CooldownRecord {
    /// Instant after which requests may resume
    pub expires_at: DateTime<Utc>,
    /// Duration the server asked for, in seconds
    #[serde(rename = "retryAfter")]
    pub retry_after_seconds: u64,
    /// When the record was written, in milliseconds since the epoch
    pub timestamp: i64,
}

impl CooldownRecord {
    /// A cooldown of `retry_after_seconds` starting at `now`, kept within
    /// `1..=MAX_RETRY_AFTER_SECS`.
    pub fn new(retry_after_seconds: u64, now: DateTime<Utc>) -> Self {
        let retry_after_seconds = retry_after_seconds.clamp(1, MAX_RETRY_AFTER_SECS);
        Self {
            expires_at: expiry_after(now, retry_after_seconds),
            retry_after_seconds,
            timestamp: now.timestamp_millis(),
        }
    }

    /// When the cooldown began.
    pub fn started_at(&self) -> DateTime<Utc> {
        seconds_delta(self.retry_after_seconds)
            .and_then(|delta| self.expires_at.checked_sub_signed(delta))
            .unwrap_or(self.expires_at)
    }

    /// Parse a stored record. Anything unparseable is `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    /// Whole seconds until expiry, rounded up. Zero once expired.
    pub fn remaining_seconds_at(&self, now: DateTime<Utc>) -> u64 {
        remaining_seconds(self.expires_at, now)
    }
}

fn seconds_delta(seconds: u64) -> Option<chrono::Duration> {
    i64::try_from(seconds)
        .ok()
        .and_then(chrono::Duration::try_seconds)
}

/// `start + seconds`, saturating at the latest representable instant.
pub(crate) fn expiry_after(start: DateTime<Utc>, seconds: u64) -> DateTime<Utc> {
    seconds_delta(seconds)
        .and_then(|delta| start.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub(crate) fn remaining_seconds(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let millis = (expires_at - now).num_milliseconds();
    if millis <= 0 {
        0
    } else {
        ((millis + 999) / 1000) as u64
    }
}

/// Reads and writes the cooldown record.
///
/// Storage failures never escape: writes that fail are logged and kept in
/// memory so this context still honours the cooldown, and reads that fail
/// fall back to that in-memory copy.
pub struct CooldownStore {
    storage: Arc<dyn SharedStorage>,
    clock: Arc<dyn Clock>,
    key: String,
    fallback: Mutex<Option<CooldownRecord>>,
    /// Bumped on every local clear; other contexts learn of it from storage.
    cleared: watch::Sender<u64>,
}

impl CooldownStore {
    pub fn new(storage: Arc<dyn SharedStorage>) -> Self {
        Self::with_clock(storage, Arc::new(SystemClock))
    }

    pub fn with_clock(storage: Arc<dyn SharedStorage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            key: DEFAULT_STORAGE_KEY.to_string(),
            fallback: Mutex::new(None),
            cleared: watch::channel(0).0,
        }
    }

    /// Use a different storage key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Subscribe to changes other contexts make to the underlying storage.
    pub fn subscribe(&self) -> StorageSubscription {
        self.storage.subscribe()
    }

    /// Notified whenever [`clear`](Self::clear) is called on this store.
    pub fn watch_clears(&self) -> watch::Receiver<u64> {
        self.cleared.subscribe()
    }

    /// Start (or replace) a cooldown of `retry_after_seconds`.
    ///
    /// Zero is raised to one second and anything above
    /// [`MAX_RETRY_AFTER_SECS`] is capped.
    pub fn write(&self, retry_after_seconds: u64) -> CooldownRecord {
        if retry_after_seconds > MAX_RETRY_AFTER_SECS {
            tracing::warn!(
                "Retry-after of {}s capped at {}s",
                retry_after_seconds,
                MAX_RETRY_AFTER_SECS
            );
        }
        let record = CooldownRecord::new(retry_after_seconds, self.clock.now());

        let persisted = serde_json::to_string(&record)
            .map_err(|e| e.to_string())
            .and_then(|raw| self.storage.set(&self.key, &raw).map_err(|e| e.to_string()));

        match persisted {
            Ok(()) => {
                tracing::info!(
                    "Rate limit cooldown set for {}s (until {})",
                    record.retry_after_seconds,
                    record.expires_at.to_rfc3339()
                );
                *self.fallback.lock() = None;
            }
            Err(e) => {
                tracing::error!("Failed to persist rate limit cooldown: {}", e);
                *self.fallback.lock() = Some(record.clone());
            }
        }
        record
    }

    /// The active cooldown, if any.
    ///
    /// Expired or malformed records are removed as a side effect.
    pub fn read(&self) -> Option<CooldownRecord> {
        self.lookup(true)
    }

    /// Like [`read`](Self::read) but never modifies storage.
    pub fn peek(&self) -> Option<CooldownRecord> {
        self.lookup(false)
    }

    fn lookup(&self, purge: bool) -> Option<CooldownRecord> {
        let now = self.clock.now();

        match self.storage.get(&self.key) {
            Ok(Some(raw)) => match CooldownRecord::parse(&raw) {
                Some(record) if record.is_active_at(now) => return Some(record),
                Some(_) => {
                    if purge {
                        tracing::debug!("Cooldown expired, removing record");
                        self.remove_quietly();
                    }
                }
                None => {
                    if purge {
                        tracing::warn!("Discarding malformed cooldown record");
                        self.remove_quietly();
                    }
                }
            },
            Ok(None) => {}
            Err(e) => tracing::error!("Failed to read rate limit cooldown: {}", e),
        }

        let mut fallback = self.fallback.lock();
        match fallback.as_ref() {
            Some(record) if record.is_active_at(now) => Some(record.clone()),
            Some(_) => {
                *fallback = None;
                None
            }
            None => None,
        }
    }

    /// Remove the cooldown.
    pub fn clear(&self) {
        *self.fallback.lock() = None;
        self.remove_quietly();
        self.cleared.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    fn remove_quietly(&self) {
        if let Err(e) = self.storage.remove(&self.key) {
            tracing::error!("Failed to remove rate limit cooldown: {}", e);
        }
    }

    /// Seconds until the cooldown ends, rounded up; zero when inactive.
    pub fn remaining_seconds(&self) -> u64 {
        self.read()
            .map(|record| record.remaining_seconds_at(self.clock.now()))
            .unwrap_or(0)
    }

    pub fn is_in_cooldown(&self) -> bool {
        self.read().is_some()
    }
}

impl std::fmt::Debug for CooldownStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CooldownStore")
            .field("key", &self.key)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}
