//! Request/response middleware.
//!
//! A [`Pipeline`] is an ordered list of [`Middleware`]. Before dispatch every
//! stage's `before` hook runs in registration order; the first error stops the
//! request before it reaches the network. After dispatch (or a transport
//! failure) every stage's `after` hook runs in reverse order and may rewrite
//! the outcome.
//!
//! The client's default order is `[StatusClassifier, CooldownGate, RequestLogger]`,
//! so a 429 is turned into a cooldown by the gate before the classifier sees it.

use std::future::Future;
use std::sync::Arc;

use ratewise_core::ApiError;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::cooldown::CooldownStore;
use crate::events::{EventBus, RateLimitEvent};

/// An outbound request as seen by middleware.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the API base URL; also the endpoint identifier
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    /// Zero-based attempt number
    pub attempt: u32,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            attempt: 0,
        }
    }

    pub fn with_query(mut self, query: Vec<(String, String)>) -> Self {
        self.query = query;
        self
    }

    pub fn with_body(mut self, body: Option<serde_json::Value>) -> Self {
        self.body = body;
        self
    }

    /// Identifier used in errors and events.
    pub fn endpoint(&self) -> &str {
        &self.path
    }
}

/// A response received from the server, whatever its status.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Decode the body. An empty body decodes as JSON `null`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        let body: &[u8] = if self.body.iter().all(u8::is_ascii_whitespace) {
            b"null"
        } else {
            &self.body
        };
        serde_json::from_slice(body)
            .map_err(|e| ApiError::InvalidResponse(format!("JSON parse error: {}", e)))
    }

    /// The `error` object of a JSON error body, if there is one.
    pub fn error_detail(&self) -> Option<ErrorDetail> {
        serde_json::from_slice::<ErrorEnvelope>(&self.body)
            .ok()
            .and_then(|envelope| envelope.error)
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: Option<ErrorDetail>,
}

/// Error object returned by the API: `{"error": {"code", "message", "retry_after"}}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
    #[serde(default)]
    pub retry_after: Option<serde_json::Value>,
}

impl ErrorDetail {
    /// `retry_after` as a positive whole number of seconds.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        self.retry_after.as_ref().and_then(positive_seconds)
    }
}

fn positive_seconds(value: &serde_json::Value) -> Option<u64> {
    let seconds = match value {
        serde_json::Value::Number(n) => n.as_f64()?,
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if seconds.is_finite() && seconds > 0.0 {
        Some(seconds.ceil() as u64)
    } else {
        None
    }
}

/// Retry-after from a 429 response: body first, then the `Retry-After`
/// header (seconds form).
pub fn retry_after_from(response: &ApiResponse) -> Option<u64> {
    response
        .error_detail()
        .and_then(|detail| detail.retry_after_seconds())
        .or_else(|| {
            response
                .headers
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .filter(|seconds| *seconds > 0)
        })
}

/// A stage in the request pipeline.
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    /// Inspect or modify the request. Returning an error stops the request.
    fn before(&self, _request: &mut ApiRequest) -> Result<(), ApiError> {
        Ok(())
    }

    /// Inspect or rewrite the outcome.
    fn after(
        &self,
        _request: &ApiRequest,
        outcome: Result<ApiResponse, ApiError>,
    ) -> Result<ApiResponse, ApiError> {
        outcome
    }
}

/// Ordered middleware stages.
#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stage: Arc<dyn Middleware>) {
        self.stages.push(stage);
    }

    pub fn with(mut self, stage: impl Middleware + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    pub fn run_before(&self, request: &mut ApiRequest) -> Result<(), ApiError> {
        for stage in &self.stages {
            if let Err(e) = stage.before(request) {
                tracing::debug!(
                    "{} stopped {} {}: {}",
                    stage.name(),
                    request.method,
                    request.path,
                    e
                );
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn run_after(
        &self,
        request: &ApiRequest,
        outcome: Result<ApiResponse, ApiError>,
    ) -> Result<ApiResponse, ApiError> {
        self.stages
            .iter()
            .rev()
            .fold(outcome, |outcome, stage| stage.after(request, outcome))
    }

    /// Run one request through every stage, calling `send` for the network
    /// step. `send` is not called if a `before` hook fails.
    pub async fn execute<F, Fut>(
        &self,
        mut request: ApiRequest,
        send: F,
    ) -> Result<ApiResponse, ApiError>
    where
        F: FnOnce(ApiRequest) -> Fut,
        Fut: Future<Output = Result<ApiResponse, ApiError>>,
    {
        self.run_before(&mut request)?;
        let outcome = send(request.clone()).await;
        self.run_after(&request, outcome)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").field("stages", &self.names()).finish()
    }
}

/// Blocks requests during a cooldown and starts one on 429.
pub struct CooldownGate {
    store: Arc<CooldownStore>,
    events: EventBus<RateLimitEvent>,
    default_retry_after: u64,
}

impl CooldownGate {
    pub fn new(
        store: Arc<CooldownStore>,
        events: EventBus<RateLimitEvent>,
        default_retry_after: u64,
    ) -> Self {
        Self {
            store,
            events,
            default_retry_after: default_retry_after.max(1),
        }
    }

    fn start_cooldown(&self, request: &ApiRequest, retry_after_seconds: u64) -> ApiError {
        let record = self.store.write(retry_after_seconds);

        tracing::warn!(
            "Rate limited on {} {}, cooling down for {}s",
            request.method,
            request.path,
            record.retry_after_seconds
        );

        self.events.publish(&RateLimitEvent {
            retry_after_seconds: record.retry_after_seconds,
            endpoint: request.endpoint().to_string(),
            timestamp: record.started_at(),
        });

        ApiError::RateLimited {
            retry_after_seconds: record.retry_after_seconds,
            endpoint: request.endpoint().to_string(),
        }
    }
}

impl Middleware for CooldownGate {
    fn name(&self) -> &'static str {
        "cooldown_gate"
    }

    fn before(&self, request: &mut ApiRequest) -> Result<(), ApiError> {
        if let Some(record) = self.store.read() {
            let remaining_seconds = record.remaining_seconds_at(self.store.now()).max(1);
            tracing::warn!(
                "Request blocked - cooldown active for {}s more: {} {}",
                remaining_seconds,
                request.method,
                request.path
            );
            return Err(ApiError::PreflightBlocked {
                remaining_seconds,
                endpoint: request.endpoint().to_string(),
            });
        }
        Ok(())
    }

    fn after(
        &self,
        request: &ApiRequest,
        outcome: Result<ApiResponse, ApiError>,
    ) -> Result<ApiResponse, ApiError> {
        match outcome {
            Ok(response) if response.status == StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = retry_after_from(&response).unwrap_or(self.default_retry_after);
                Err(self.start_cooldown(request, retry_after))
            }
            other => other,
        }
    }
}

/// Turns non-2xx responses into [`ApiError`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatusClassifier;

impl Middleware for StatusClassifier {
    fn name(&self) -> &'static str {
        "status_classifier"
    }

    fn after(
        &self,
        request: &ApiRequest,
        outcome: Result<ApiResponse, ApiError>,
    ) -> Result<ApiResponse, ApiError> {
        let response = outcome?;
        if response.status.is_success() {
            return Ok(response);
        }

        let message = response
            .error_detail()
            .and_then(|detail| detail.message)
            .unwrap_or_else(|| format!("Request failed with status {}", response.status));
        let error = ApiError::from_status(response.status.as_u16(), message);

        if response.status.is_server_error() {
            tracing::error!("{} {} failed: {}", request.method, request.path, error);
        } else {
            tracing::warn!("{} {} failed: {}", request.method, request.path, error);
        }
        Err(error)
    }
}

/// Logs each request and its outcome at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestLogger;

impl Middleware for RequestLogger {
    fn name(&self) -> &'static str {
        "request_logger"
    }

    fn before(&self, request: &mut ApiRequest) -> Result<(), ApiError> {
        tracing::debug!(
            "→ {} {} (attempt {})",
            request.method,
            request.path,
            request.attempt + 1
        );
        Ok(())
    }

    fn after(
        &self,
        request: &ApiRequest,
        outcome: Result<ApiResponse, ApiError>,
    ) -> Result<ApiResponse, ApiError> {
        match &outcome {
            Ok(response) => {
                tracing::debug!("← {} {} {}", response.status, request.method, request.path)
            }
            Err(e) => tracing::debug!("✗ {} {}: {}", request.method, request.path, e),
        }
        outcome
    }
}
