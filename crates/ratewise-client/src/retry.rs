//! Retry with exponential backoff for transient failures.
//!
//! Retried:
//! - Network errors (connection refused, reset, DNS)
//! - Timeouts
//! - 503 Service Unavailable
//!
//! Never retried:
//! - Rate limits (429) and requests blocked by an active cooldown
//! - Every other 4xx and 5xx status
//! - Non-idempotent requests (POST, PATCH)
//!
//! [`retry_all`] and [`batch_with_retry`] drive many operations at once, each
//! with its own retry budget.

use std::future::Future;
use std::time::Duration;

use futures::future::try_join_all;
use rand::Rng;
use ratewise_core::{ApiError, RetrySettings};
use reqwest::Method;
use tokio_util::sync::CancellationToken;

/// Default retry configuration
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 1000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

/// Operations in flight at once in [`batch_with_retry`]
pub const DEFAULT_BATCH_CONCURRENCY: usize = 5;

/// Retry configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier applied per attempt
    pub backoff_factor: f64,
    /// Random spread applied to each delay, as a fraction (0.0..=1.0)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            jitter: 0.0,
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with custom settings
    pub fn new(max_retries: u32, initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_millis(initial_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms),
            ..Self::default()
        }
    }

    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Calculate the delay for a given attempt number (zero-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        compute_delay(attempt, self.initial_delay, self.max_delay, self.backoff_factor)
    }

    /// [`delay_for_attempt`](Self::delay_for_attempt) with jitter applied.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-1.0..=1.0);
        apply_jitter(delay, self.jitter, spread)
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        Self::new(
            settings.max_retries,
            settings.initial_delay_ms,
            settings.max_delay_ms,
        )
        .with_backoff_factor(settings.backoff_factor)
        .with_jitter(settings.jitter)
    }
}

/// `initial * factor^attempt`, capped at `max`.
pub fn compute_delay(attempt: u32, initial: Duration, max: Duration, factor: f64) -> Duration {
    let exponent = attempt.min(i32::MAX as u32) as i32;
    let delay_ms = initial.as_millis() as f64 * factor.powi(exponent);
    let capped = delay_ms.min(max.as_millis() as f64).max(0.0);
    Duration::from_millis(capped.round() as u64)
}

/// Scale `delay` by `1 + spread * jitter`, where `spread` is in -1.0..=1.0.
pub fn apply_jitter(delay: Duration, jitter: f64, spread: f64) -> Duration {
    let factor = 1.0 + spread.clamp(-1.0, 1.0) * jitter.clamp(0.0, 1.0);
    Duration::from_millis((delay.as_millis() as f64 * factor).round() as u64)
}

/// Error classification for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Should retry the request
    Retry,
    /// Should not retry - permanent failure or rate limit
    NoRetry,
}

/// Decide whether a failed attempt should be retried.
///
/// Only the classification is considered here; the attempt budget is
/// enforced by [`with_retry`].
pub fn should_retry(error: &ApiError, attempt: u32) -> RetryDecision {
    match error {
        ApiError::RateLimited { .. } | ApiError::PreflightBlocked { .. } => {
            tracing::debug!("Rate limited on attempt {}, not retrying", attempt + 1);
            RetryDecision::NoRetry
        }
        ApiError::Network(_) | ApiError::Timeout | ApiError::ServiceUnavailable { .. } => {
            tracing::debug!("Transient failure on attempt {}, will retry: {}", attempt + 1, error);
            RetryDecision::Retry
        }
        _ => {
            tracing::debug!("Permanent failure, not retryable: {}", error);
            RetryDecision::NoRetry
        }
    }
}

/// Whether `method` is safe to send more than once.
pub fn is_idempotent(method: &Method) -> bool {
    !matches!(*method, Method::POST | Method::PATCH)
}

/// Details of a retry about to happen.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    /// Zero-based index of the attempt that failed
    pub attempt: u32,
    pub error: ApiError,
    /// How long we will wait before the next attempt
    pub delay: Duration,
}

/// Run `operation` until it succeeds, fails permanently, or runs out of
/// retries.
///
/// `operation` receives the zero-based attempt number. `on_retry` is called
/// before every backoff sleep. If `cancel` fires before or during a sleep,
/// no further attempt is made and [`ApiError::Cancelled`] is returned.
///
/// # Example
/// ```ignore
/// let body = with_retry(&RetryConfig::default(), None, None, |_attempt| async {
///     client.get_once("/api/v1/weather").await
/// }).await?;
/// ```
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    cancel: Option<&CancellationToken>,
    on_retry: Option<&(dyn Fn(&RetryAttempt) + Send + Sync)>,
    mut operation: F,
) -> Result<T, ApiError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempt = 0;

    loop {
        if cancel.is_some_and(|token| token.is_cancelled()) {
            tracing::debug!("Request cancelled before attempt {}", attempt + 1);
            return Err(ApiError::Cancelled);
        }

        let error = match operation(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!("Request succeeded after {} retries", attempt);
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if should_retry(&error, attempt) == RetryDecision::NoRetry {
            return Err(error);
        }

        if attempt >= config.max_retries {
            if config.max_retries > 0 {
                tracing::error!("All {} attempts exhausted: {}", config.max_retries + 1, error);
            }
            return Err(error);
        }

        let delay = config.jittered_delay(attempt);
        tracing::warn!(
            "Retryable error on attempt {} of {}: {}. Retrying in {:?}",
            attempt + 1,
            config.max_retries + 1,
            error,
            delay
        );

        if let Some(callback) = on_retry {
            callback(&RetryAttempt {
                attempt,
                error,
                delay,
            });
        }

        match cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!("Request cancelled during backoff");
                        return Err(ApiError::Cancelled);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None => tokio::time::sleep(delay).await,
        }

        attempt += 1;
    }
}

/// Run every operation concurrently, each retried on its own.
///
/// Results keep the order of `operations`. The first error is returned.
pub async fn retry_all<T, F, Fut>(
    config: &RetryConfig,
    operations: Vec<F>,
) -> Result<Vec<T>, ApiError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    try_join_all(
        operations
            .into_iter()
            .map(|operation| with_retry(config, None, None, operation)),
    )
    .await
}

/// Apply `f` to every item, `concurrency` items at a time.
///
/// Items are taken in consecutive batches; a batch starts once the previous
/// one has finished. Each call is retried on its own with `config`. Results
/// keep the order of `items`. The first error stops later batches.
pub async fn batch_with_retry<T, R, F, Fut>(
    items: Vec<T>,
    concurrency: usize,
    config: &RetryConfig,
    f: F,
) -> Result<Vec<R>, ApiError>
where
    T: Clone,
    F: Fn(T, u32) -> Fut,
    Fut: Future<Output = Result<R, ApiError>>,
{
    let concurrency = concurrency.max(1);
    let batches = items.len().div_ceil(concurrency);
    let mut results = Vec::with_capacity(items.len());

    for (index, batch) in items.chunks(concurrency).enumerate() {
        tracing::debug!("Running batch {} of {} ({} items)", index + 1, batches, batch.len());
        let f = &f;
        let batch_results = try_join_all(batch.iter().map(|item| {
            with_retry(config, None, None, move |attempt| f(item.clone(), attempt))
        }))
        .await?;
        results.extend(batch_results);
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_retries: u32) -> RetryConfig {
        RetryConfig::new(max_retries, 1, 5)
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.initial_delay, Duration::from_millis(1000));
        assert_eq!(config.max_delay, Duration::from_millis(30_000));
        assert_eq!(config.backoff_factor, 2.0);
    }

    #[test]
    fn test_delay_calculation() {
        let config = RetryConfig::default();

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(4000));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(8000));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(16000));
        assert_eq!(config.delay_for_attempt(5), Duration::from_millis(30000));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let config = RetryConfig::new(10, 100, 1000);

        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(10), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn test_custom_backoff_factor() {
        let config = RetryConfig::new(3, 500, 30_000).with_backoff_factor(3.0);
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(4500));
    }

    #[test]
    fn test_jitter_bounds() {
        let delay = Duration::from_millis(1000);
        assert_eq!(apply_jitter(delay, 0.2, -1.0), Duration::from_millis(800));
        assert_eq!(apply_jitter(delay, 0.2, 1.0), Duration::from_millis(1200));
        assert_eq!(apply_jitter(delay, 0.0, 1.0), delay);

        let config = RetryConfig::default().with_jitter(0.5);
        for _ in 0..50 {
            let d = config.jittered_delay(0);
            assert!(d >= Duration::from_millis(500) && d <= Duration::from_millis(1500));
        }
    }

    #[test]
    fn test_from_settings() {
        let config = RetryConfig::from(&RetrySettings::default());
        assert_eq!(config, RetryConfig::default());
    }

    #[test]
    fn test_retry_classification() {
        let network = ApiError::Network("reset".into());
        let unavailable = ApiError::ServiceUnavailable {
            message: "down".into(),
        };
        assert_eq!(should_retry(&network, 0), RetryDecision::Retry);
        assert_eq!(should_retry(&ApiError::Timeout, 0), RetryDecision::Retry);
        assert_eq!(should_retry(&unavailable, 0), RetryDecision::Retry);

        let rate_limited = ApiError::RateLimited {
            retry_after_seconds: 10,
            endpoint: "/x".into(),
        };
        let blocked = ApiError::PreflightBlocked {
            remaining_seconds: 5,
            endpoint: "/x".into(),
        };
        assert_eq!(should_retry(&rate_limited, 0), RetryDecision::NoRetry);
        assert_eq!(should_retry(&blocked, 0), RetryDecision::NoRetry);

        for status in [400u16, 401, 403, 404, 500, 502] {
            let err = ApiError::from_status(status, "nope");
            assert_eq!(should_retry(&err, 0), RetryDecision::NoRetry, "status {}", status);
        }
    }

    #[test]
    fn test_idempotent_methods() {
        assert!(is_idempotent(&Method::GET));
        assert!(is_idempotent(&Method::PUT));
        assert!(is_idempotent(&Method::DELETE));
        assert!(!is_idempotent(&Method::POST));
        assert!(!is_idempotent(&Method::PATCH));
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast(3), None, None, |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ApiError::Timeout)
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_budget() {
        let calls = AtomicU32::new(0);
        let retries = Arc::new(AtomicU32::new(0));
        let seen = retries.clone();
        let on_retry = move |_: &RetryAttempt| {
            seen.fetch_add(1, Ordering::SeqCst);
        };

        let result: Result<(), _> = with_retry(&fast(2), None, Some(&on_retry), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ApiError::Network("refused".into())) }
        })
        .await;

        assert!(matches!(result, Err(ApiError::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rate_limit_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast(3), None, None, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(ApiError::RateLimited {
                    retry_after_seconds: 10,
                    endpoint: "/x".into(),
                })
            }
        })
        .await;

        assert!(result.unwrap_err().is_rate_limit());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_retry_config_makes_one_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&RetryConfig::no_retry(), None, None, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ApiError::Timeout) }
        })
        .await;

        assert_eq!(result.unwrap_err(), ApiError::Timeout);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_numbers_passed_to_operation() {
        let seen = parking_lot::Mutex::new(Vec::new());
        let _: Result<(), _> = with_retry(&fast(2), None, None, |attempt| {
            seen.lock().push(attempt);
            async { Err(ApiError::Timeout) }
        })
        .await;

        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let token = CancellationToken::new();
        let cancel_on_retry = token.clone();
        let on_retry = move |_: &RetryAttempt| cancel_on_retry.cancel();
        let calls = AtomicU32::new(0);

        let config = RetryConfig::new(3, 10_000, 30_000);
        let result: Result<(), _> = with_retry(&config, Some(&token), Some(&on_retry), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ApiError::Timeout) }
        })
        .await;

        assert_eq!(result.unwrap_err(), ApiError::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let token = CancellationToken::new();
        token.cancel();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = with_retry(&fast(3), Some(&token), None, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;

        assert_eq!(result.unwrap_err(), ApiError::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_batch_limits_in_flight() {
        let in_flight = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let results = batch_with_retry((1..=7).collect(), 2, &fast(1), |item: u32, _| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(item * 10)
            }
        })
        .await
        .unwrap();

        assert_eq!(results, vec![10, 20, 30, 40, 50, 60, 70]);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_batch_retries_each_item() {
        let calls = Arc::new(AtomicU32::new(0));

        let items = vec!["a", "b"];
        let results = batch_with_retry(items, DEFAULT_BATCH_CONCURRENCY, &fast(2), |item, attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(ApiError::Timeout)
                } else {
                    Ok(item.to_uppercase())
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(results, vec!["A", "B"]);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_batch_error_stops_later_batches() {
        let calls = Arc::new(AtomicU32::new(0));

        let items = vec![1, 2, 3, 4];
        let result: Result<Vec<u32>, _> = batch_with_retry(items, 2, &fast(3), |item, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if item == 2 {
                    Err(ApiError::from_status(404, "missing"))
                } else {
                    Ok(item)
                }
            }
        })
        .await;

        assert!(matches!(result, Err(ApiError::NotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_all_keeps_order() {
        let operations: Vec<_> = (0..3u32)
            .map(|n| move |attempt: u32| async move {
                if n == 1 && attempt == 0 {
                    Err(ApiError::Network("reset".into()))
                } else {
                    Ok(n)
                }
            })
            .collect();

        let results = retry_all(&fast(1), operations).await.unwrap();
        assert_eq!(results, vec![0, 1, 2]);
    }
}
