//! Rate-limit-aware HTTP client.
//!
//! A 429 from the server starts a cooldown that is written to shared storage,
//! so every client sharing that storage stops sending requests until it ends.
//! Transient failures are retried with exponential backoff; rate limits never
//! are.

pub mod client;
pub mod clock;
pub mod cooldown;
pub mod endpoints;
pub mod events;
pub mod pipeline;
pub mod retry;
pub mod sqlite_storage;
pub mod storage;
pub mod sync;

pub use client::{ApiClient, ApiClientBuilder, RequestConfig, RetryCallback};
pub use clock::{Clock, ManualClock, SystemClock};
pub use cooldown::{CooldownRecord, CooldownStore};
pub use endpoints::{CreateInsightRequest, InsightQuery, InsightSort};
pub use events::{EventBus, RateLimitEvent, Subscription};
pub use pipeline::{
    ApiRequest, ApiResponse, CooldownGate, Middleware, Pipeline, RequestLogger, StatusClassifier,
};
pub use retry::{
    batch_with_retry, retry_all, should_retry, with_retry, RetryAttempt, RetryConfig,
    RetryDecision,
};
pub use sqlite_storage::SqliteStorage;
pub use storage::{MemoryStorage, SharedStorage, StorageChange, StorageSubscription};
pub use sync::{CooldownState, CooldownSync};

pub use ratewise_core::{ApiError, ErrorKind};
