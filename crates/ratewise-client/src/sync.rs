//! Keeps a context's view of the cooldown in step with every other context.
//!
//! The synchronizer listens to storage changes made by other contexts and to
//! rate-limit events and clears made in this context. It also returns to idle
//! when the current cooldown expires. It only ever reads storage.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::cooldown::{remaining_seconds, CooldownRecord, CooldownStore};
use crate::events::{EventBus, RateLimitEvent};
use crate::storage::StorageChange;

/// Observable cooldown state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CooldownState {
    #[default]
    Idle,
    Cooling {
        expires_at: DateTime<Utc>,
        retry_after_seconds: u64,
    },
}

impl CooldownState {
    fn from_record(record: Option<CooldownRecord>) -> Self {
        match record {
            Some(record) => Self::Cooling {
                expires_at: record.expires_at,
                retry_after_seconds: record.retry_after_seconds,
            },
            None => Self::Idle,
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Idle => None,
            Self::Cooling { expires_at, .. } => Some(*expires_at),
        }
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|expires_at| expires_at > now)
    }

    pub fn remaining_seconds_at(&self, now: DateTime<Utc>) -> u64 {
        self.expires_at()
            .map(|expires_at| remaining_seconds(expires_at, now))
            .unwrap_or(0)
    }
}

/// Cross-context cooldown synchronizer.
pub struct CooldownSync {
    store: Arc<CooldownStore>,
    clock: Arc<dyn Clock>,
    state: watch::Sender<CooldownState>,
}

impl CooldownSync {
    /// Create a synchronizer seeded from the current record.
    pub fn new(store: Arc<CooldownStore>) -> Self {
        let initial = CooldownState::from_record(store.peek());
        let (state, _) = watch::channel(initial);
        Self {
            clock: store.clock(),
            store,
            state,
        }
    }

    pub fn state(&self) -> CooldownState {
        self.state.borrow().clone()
    }

    pub fn is_in_cooldown(&self) -> bool {
        self.state.borrow().is_active_at(self.clock.now())
    }

    pub fn remaining_seconds(&self) -> u64 {
        self.state.borrow().remaining_seconds_at(self.clock.now())
    }

    /// Receive every state transition.
    pub fn watch(&self) -> watch::Receiver<CooldownState> {
        self.state.subscribe()
    }

    /// Re-read the stored record.
    pub fn refresh(&self) {
        self.set_state(CooldownState::from_record(self.store.peek()));
    }

    /// Apply a change made by another context.
    pub fn apply_change(&self, change: &StorageChange) {
        if change.key != self.store.key() {
            return;
        }

        let now = self.clock.now();
        let record = change
            .new_value
            .as_deref()
            .and_then(CooldownRecord::parse)
            .filter(|record| record.is_active_at(now));

        if change.new_value.is_some() && record.is_none() {
            tracing::debug!("Ignoring inactive or malformed cooldown from another context");
        }
        self.set_state(CooldownState::from_record(record));
    }

    /// Apply a rate-limit event published in this context.
    pub fn apply_event(&self, event: &RateLimitEvent) {
        let expires_at = event.expires_at();
        if expires_at <= self.clock.now() {
            return;
        }
        self.set_state(CooldownState::Cooling {
            expires_at,
            retry_after_seconds: event.retry_after_seconds,
        });
    }

    /// Return to idle if the current cooldown has ended.
    pub fn expire_if_due(&self) {
        let now = self.clock.now();
        self.state.send_if_modified(|state| {
            if matches!(state, CooldownState::Cooling { .. }) && !state.is_active_at(now) {
                tracing::info!("Rate limit cooldown ended");
                *state = CooldownState::Idle;
                true
            } else {
                false
            }
        });
    }

    fn set_state(&self, next: CooldownState) {
        self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            match &next {
                CooldownState::Idle => tracing::info!("Rate limit cooldown cleared"),
                CooldownState::Cooling { expires_at, .. } => tracing::info!(
                    "Rate limit cooldown active until {}",
                    expires_at.to_rfc3339()
                ),
            }
            *state = next;
            true
        });
    }

    fn time_until_expiry(&self) -> Option<Duration> {
        let expires_at = self.state.borrow().expires_at()?;
        Some((expires_at - self.clock.now()).to_std().unwrap_or_default())
    }

    /// Run the synchronizer until `cancel` fires.
    pub fn spawn(
        self: &Arc<Self>,
        events: &EventBus<RateLimitEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let mut changes = self.store.subscribe();
        let mut clears = self.store.watch_clears();
        // Catch anything written between construction and subscribing.
        self.refresh();

        let (tx, mut local) = mpsc::unbounded_channel();
        let subscription = events.subscribe(move |event: &RateLimitEvent| {
            let _ = tx.send(event.clone());
        });

        let this = self.clone();
        tokio::spawn(async move {
            let _subscription = subscription;
            loop {
                let expiry = this.time_until_expiry();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    change = changes.recv() => match change {
                        Some(change) => this.apply_change(&change),
                        None => {
                            tracing::warn!("Shared storage closed, stopping cooldown sync");
                            break;
                        }
                    },
                    Some(event) = local.recv() => this.apply_event(&event),
                    Ok(()) = clears.changed() => this.refresh(),
                    _ = sleep_for(expiry) => this.expire_if_due(),
                }
            }
            tracing::debug!("Cooldown sync stopped");
        })
    }
}

async fn sleep_for(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

impl std::fmt::Debug for CooldownSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CooldownSync")
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}
