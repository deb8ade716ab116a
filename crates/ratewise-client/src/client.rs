use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ratewise_core::config::{DEFAULT_RETRY_AFTER_SECS, DEFAULT_STORAGE_KEY};
use ratewise_core::{ApiError, Config, Environment, ReqwestErrorExt};
use reqwest::{header, Client, Method};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::clock::{Clock, SystemClock};
use crate::cooldown::CooldownStore;
use crate::events::{EventBus, RateLimitEvent, Subscription};
use crate::pipeline::{
    ApiRequest, ApiResponse, CooldownGate, Middleware, Pipeline, RequestLogger, StatusClassifier,
};
use crate::retry::{is_idempotent, with_retry, RetryAttempt, RetryConfig};
use crate::storage::{MemoryStorage, SharedStorage};
use crate::sync::CooldownSync;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Called before each retry.
pub type RetryCallback = Arc<dyn Fn(&RetryAttempt) + Send + Sync>;

/// Per-request options.
#[derive(Clone, Default)]
pub struct RequestConfig {
    /// Overrides the client's retry policy (ignored for POST/PATCH)
    pub retry: Option<RetryConfig>,
    pub query: Vec<(String, String)>,
    pub cancel: Option<CancellationToken>,
    pub timeout: Option<Duration>,
    pub on_retry: Option<RetryCallback>,
}

impl RequestConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn no_retry(self) -> Self {
        self.with_retry(RetryConfig::no_retry())
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn on_retry<F>(mut self, callback: F) -> Self
    where
        F: Fn(&RetryAttempt) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(callback));
        self
    }
}

impl std::fmt::Debug for RequestConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestConfig")
            .field("retry", &self.retry)
            .field("query", &self.query)
            .field("timeout", &self.timeout)
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

/// Builder for [`ApiClient`].
pub struct ApiClientBuilder {
    base_url: String,
    storage: Option<Arc<dyn SharedStorage>>,
    clock: Option<Arc<dyn Clock>>,
    retry: RetryConfig,
    timeout: Duration,
    storage_key: String,
    default_retry_after: u64,
    environment: Environment,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl ApiClientBuilder {
    fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            storage: None,
            clock: None,
            retry: RetryConfig::default(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            default_retry_after: DEFAULT_RETRY_AFTER_SECS,
            environment: Environment::default(),
            middleware: Vec::new(),
        }
    }

    /// Shared storage for the cooldown record. Defaults to a private
    /// in-memory medium.
    pub fn storage(mut self, storage: Arc<dyn SharedStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Default retry policy for idempotent requests.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }

    /// Cooldown applied when a 429 carries no retry-after.
    pub fn default_retry_after(mut self, seconds: u64) -> Self {
        self.default_retry_after = seconds;
        self
    }

    pub fn environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Append a stage after the built-in ones.
    pub fn middleware(mut self, stage: impl Middleware + 'static) -> Self {
        self.middleware.push(Arc::new(stage));
        self
    }

    pub fn build(self) -> Result<ApiClient> {
        let base_url = Url::parse(&self.base_url)
            .with_context(|| format!("Invalid API base URL: {}", self.base_url))?;

        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));

        let http = Client::builder()
            .timeout(self.timeout)
            .default_headers(headers)
            .build()
            .context("Failed to create HTTP client")?;

        let storage: Arc<dyn SharedStorage> = match self.storage {
            Some(storage) => storage,
            None => Arc::new(MemoryStorage::new()),
        };
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let store = Arc::new(CooldownStore::with_clock(storage, clock).with_key(self.storage_key));
        let events = EventBus::new();

        let mut pipeline = Pipeline::new()
            .with(StatusClassifier)
            .with(CooldownGate::new(store.clone(), events.clone(), self.default_retry_after));
        if self.environment == Environment::Development {
            pipeline = pipeline.with(RequestLogger);
        }
        for stage in self.middleware {
            pipeline.push(stage);
        }

        tracing::debug!("API client for {} with stages {:?}", base_url, pipeline.names());

        Ok(ApiClient {
            http: Arc::new(http),
            base_url,
            pipeline,
            retry: self.retry,
            store,
            events,
        })
    }
}

/// HTTP client that honours the shared rate-limit cooldown.
#[derive(Clone)]
pub struct ApiClient {
    http: Arc<Client>,
    base_url: Url,
    pipeline: Pipeline,
    retry: RetryConfig,
    store: Arc<CooldownStore>,
    events: EventBus<RateLimitEvent>,
}

impl ApiClient {
    pub fn builder(base_url: impl Into<String>) -> ApiClientBuilder {
        ApiClientBuilder::new(base_url)
    }

    /// Build a client from loaded configuration.
    pub fn from_config(config: &Config, storage: Arc<dyn SharedStorage>) -> Result<Self> {
        Self::builder(config.api.base_url.clone())
            .storage(storage)
            .retry(RetryConfig::from(&config.retry))
            .timeout(Duration::from_secs(config.api.timeout_secs))
            .storage_key(config.cooldown.storage_key.clone())
            .default_retry_after(config.cooldown.default_retry_after_secs)
            .environment(config.api.environment)
            .build()
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The shared cooldown record.
    pub fn cooldown(&self) -> &Arc<CooldownStore> {
        &self.store
    }

    pub fn events(&self) -> &EventBus<RateLimitEvent> {
        &self.events
    }

    /// Be told whenever a request from this client is rate limited.
    pub fn on_rate_limit_event<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&RateLimitEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(handler)
    }

    pub fn is_in_cooldown(&self) -> bool {
        self.store.is_in_cooldown()
    }

    pub fn remaining_cooldown_seconds(&self) -> u64 {
        self.store.remaining_seconds()
    }

    pub fn clear_cooldown(&self) {
        self.store.clear();
    }

    /// A synchronizer wired to this client's storage and events. Not started.
    pub fn synchronizer(&self) -> Arc<CooldownSync> {
        Arc::new(CooldownSync::new(self.store.clone()))
    }

    /// Build and start a synchronizer.
    pub fn start_sync(&self, cancel: CancellationToken) -> (Arc<CooldownSync>, JoinHandle<()>) {
        let sync = self.synchronizer();
        let handle = sync.spawn(&self.events, cancel);
        (sync, handle)
    }

    /// Sleep until any active cooldown has passed.
    pub async fn wait_for_cooldown(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), ApiError> {
        let remaining = self.store.remaining_seconds();
        if remaining == 0 {
            return Ok(());
        }

        tracing::info!("Waiting {}s for rate limit cooldown", remaining);
        let sleep = tokio::time::sleep(Duration::from_secs(remaining));
        match cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(ApiError::Cancelled),
                _ = sleep => Ok(()),
            },
            None => {
                sleep.await;
                Ok(())
            }
        }
    }

    /// Send a request and decode the JSON response.
    pub async fn perform_request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        config: RequestConfig,
    ) -> Result<T, ApiError> {
        self.send(method, path, body, config).await?.json()
    }

    /// Send a request and return the successful response undecoded.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        config: RequestConfig,
    ) -> Result<ApiResponse, ApiError> {
        let retry = if is_idempotent(&method) {
            config.retry.clone().unwrap_or_else(|| self.retry.clone())
        } else {
            RetryConfig::no_retry()
        };

        let request = ApiRequest::new(method, path)
            .with_query(config.query.clone())
            .with_body(body);

        with_retry(&retry, config.cancel.as_ref(), config.on_retry.as_deref(), |attempt| {
            let mut request = request.clone();
            request.attempt = attempt;
            self.execute_once(request, config.timeout)
        })
        .await
    }

    async fn execute_once(
        &self,
        request: ApiRequest,
        timeout: Option<Duration>,
    ) -> Result<ApiResponse, ApiError> {
        self.pipeline
            .execute(request, |request| self.dispatch(request, timeout))
            .await
    }

    fn endpoint_url(&self, path: &str) -> Result<Url, ApiError> {
        let joined = format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Url::parse(&joined)
            .map_err(|e| ApiError::InvalidRequest(format!("Invalid path {}: {}", path, e)))
    }

    async fn dispatch(
        &self,
        request: ApiRequest,
        timeout: Option<Duration>,
    ) -> Result<ApiResponse, ApiError> {
        let url = self.endpoint_url(&request.path)?;

        let mut builder = self.http.request(request.method.clone(), url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(|e| {
            let error = e.into_api_error();
            tracing::warn!("{} {} failed: {}", request.method, request.path, error);
            error
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| e.into_api_error())?
            .to_vec();

        Ok(ApiResponse::new(status, headers, body))
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        config: RequestConfig,
    ) -> Result<T, ApiError> {
        self.perform_request(Method::GET, path, None, config).await
    }

    pub async fn post<T, B>(
        &self,
        path: &str,
        body: &B,
        config: RequestConfig,
    ) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let body = to_json(body)?;
        self.perform_request(Method::POST, path, Some(body), config).await
    }

    pub async fn put<T, B>(
        &self,
        path: &str,
        body: &B,
        config: RequestConfig,
    ) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let body = to_json(body)?;
        self.perform_request(Method::PUT, path, Some(body), config).await
    }

    pub async fn delete<T: DeserializeOwned>(
        &self,
        path: &str,
        config: RequestConfig,
    ) -> Result<T, ApiError> {
        self.perform_request(Method::DELETE, path, None, config).await
    }
}

fn to_json<B: Serialize + ?Sized>(body: &B) -> Result<serde_json::Value, ApiError> {
    serde_json::to_value(body)
        .map_err(|e| ApiError::InvalidRequest(format!("Failed to encode body: {}", e)))
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url.as_str())
            .field("pipeline", &self.pipeline)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(uri: &str) -> ApiClient {
        ApiClient::builder(uri)
            .retry(RetryConfig::new(2, 1, 5))
            .build()
            .unwrap()
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(ApiClient::builder("not a url").build().is_err());
    }

    #[test]
    fn test_default_stages() {
        let dev = ApiClient::builder("http://localhost:8000").build().unwrap();
        assert_eq!(
            dev.pipeline.names(),
            vec!["status_classifier", "cooldown_gate", "request_logger"]
        );

        let prod = ApiClient::builder("http://localhost:8000")
            .environment(Environment::Production)
            .build()
            .unwrap();
        assert_eq!(prod.pipeline.names(), vec!["status_classifier", "cooldown_gate"]);
    }

    #[test]
    fn test_endpoint_url_keeps_base_path() {
        let client = ApiClient::builder("https://api.example.com/prefix/").build().unwrap();
        assert_eq!(
            client.endpoint_url("/api/v1/weather").unwrap().as_str(),
            "https://api.example.com/prefix/api/v1/weather"
        );
    }

    #[test]
    fn test_from_config() {
        let mut config = Config::default();
        config.api.base_url = "http://localhost:9000".to_string();
        config.cooldown.storage_key = "custom".to_string();

        let client = ApiClient::from_config(&config, Arc::new(MemoryStorage::new())).unwrap();
        assert_eq!(client.base_url().as_str(), "http://localhost:9000/");
        assert_eq!(client.cooldown().key(), "custom");
        assert_eq!(client.retry, RetryConfig::default());
    }

    #[tokio::test]
    async fn test_get_with_query() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v1/things"))
            .and(query_param("q", "abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(1)
            .mount(&mock_server)
            .await;

        let value: serde_json::Value = client(&mock_server.uri())
            .get("/api/v1/things", RequestConfig::new().with_query("q", "abc"))
            .await
            .unwrap();
        assert_eq!(value["ok"], true);
    }

    #[tokio::test]
    async fn test_post_sends_json_body() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/v1/things"))
            .and(body_json(serde_json::json!({"name": "x"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"id": 7})))
            .expect(1)
            .mount(&mock_server)
            .await;

        let value: serde_json::Value = client(&mock_server.uri())
            .post("/api/v1/things", &serde_json::json!({"name": "x"}), RequestConfig::new())
            .await
            .unwrap();
        assert_eq!(value["id"], 7);
    }

    #[tokio::test]
    async fn test_empty_response_decodes_as_unit() {
        let mock_server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/api/v1/things/1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&mock_server)
            .await;

        let result: Result<(), ApiError> = client(&mock_server.uri())
            .delete("/api/v1/things/1", RequestConfig::new())
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_clear_cooldown_resets_own_synchronizer() {
        let client = client("http://localhost:8000");
        let cancel = CancellationToken::new();
        let (sync, task) = client.start_sync(cancel.clone());
        let mut state = sync.watch();

        let record = client.cooldown().write(30);
        client.events().publish(&RateLimitEvent {
            retry_after_seconds: 30,
            endpoint: "/api/v1/weather".to_string(),
            timestamp: record.started_at(),
        });
        tokio::time::timeout(Duration::from_secs(1), state.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(sync.is_in_cooldown());

        client.clear_cooldown();
        tokio::time::timeout(Duration::from_secs(1), state.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(!client.is_in_cooldown());
        assert!(!sync.is_in_cooldown());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_cooldown_returns_immediately_when_idle() {
        let client = client("http://localhost:8000");
        assert!(client.wait_for_cooldown(None).await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_cooldown_cancel() {
        let client = client("http://localhost:8000");
        client.cooldown().write(60);
        let token = CancellationToken::new();
        token.cancel();

        assert_eq!(
            client.wait_for_cooldown(Some(&token)).await.unwrap_err(),
            ApiError::Cancelled
        );
    }
}
