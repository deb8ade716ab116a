//! Integration tests for retry behaviour against a mock HTTP server.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ratewise_client::{
    ApiClient, ApiError, MemoryStorage, RequestConfig, RetryConfig, SharedStorage,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const INSIGHTS: &str = "/api/v1/insights";

fn fast_client(uri: &str) -> ApiClient {
    ApiClient::builder(uri)
        .retry(RetryConfig::new(2, 1, 5))
        .build()
        .unwrap()
}

fn counting_config(retries: &Arc<AtomicUsize>) -> RequestConfig {
    let seen = retries.clone();
    RequestConfig::new().on_retry(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    })
}

/// A server that drops the first connection without answering and serves a
/// small JSON body on every later one.
async fn flaky_server() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let seen = connections.clone();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                drop(socket);
                continue;
            }
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let body = br#"{"ok":true}"#;
                let head = format!(
                    "HTTP/1.1 200 OK\r\n\
                     Content-Type: application/json\r\n\
                     Content-Length: {}\r\n\
                     Connection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(body).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (format!("http://{}", addr), connections)
}

#[tokio::test]
async fn test_connection_error_then_success() {
    let (uri, connections) = flaky_server().await;
    let storage = MemoryStorage::new();
    let client = ApiClient::builder(&uri)
        .storage(Arc::new(storage.clone()))
        .retry(RetryConfig::new(2, 10, 50))
        .build()
        .unwrap();
    let retries = Arc::new(AtomicUsize::new(0));

    let value: serde_json::Value = client
        .get(INSIGHTS, counting_config(&retries))
        .await
        .unwrap();

    assert_eq!(value["ok"], true);
    assert_eq!(connections.load(Ordering::SeqCst), 2);
    assert_eq!(retries.load(Ordering::SeqCst), 1);
    assert!(storage.get("rateLimitCooldown").unwrap().is_none());
}

#[tokio::test]
async fn test_connection_refused_exhausts_retries() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = fast_client(&format!("http://{}", addr));
    let retries = Arc::new(AtomicUsize::new(0));

    let result: Result<serde_json::Value, _> =
        client.get(INSIGHTS, counting_config(&retries)).await;

    assert!(matches!(result, Err(ApiError::Network(_))));
    assert_eq!(retries.load(Ordering::SeqCst), 2);
    assert!(!client.is_in_cooldown());
}

#[tokio::test]
async fn test_503_is_retried_until_success() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(INSIGHTS))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path(INSIGHTS))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"insights": []})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let value: serde_json::Value = fast_client(&mock_server.uri())
        .get(INSIGHTS, RequestConfig::new())
        .await
        .unwrap();
    assert!(value["insights"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_503_gives_up_after_budget() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(INSIGHTS))
        .respond_with(ResponseTemplate::new(503).set_body_json(serde_json::json!({
            "error": {"code": "OPENWEATHER_API_ERROR", "message": "Upstream unavailable"}
        })))
        .expect(3)
        .mount(&mock_server)
        .await;

    let result: Result<serde_json::Value, _> = fast_client(&mock_server.uri())
        .get(INSIGHTS, RequestConfig::new())
        .await;
    assert_eq!(
        result.unwrap_err(),
        ApiError::ServiceUnavailable {
            message: "Upstream unavailable".to_string()
        }
    );
}

#[tokio::test]
async fn test_permanent_errors_are_not_retried() {
    for status in [400u16, 401, 403, 404, 500] {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(INSIGHTS))
            .respond_with(ResponseTemplate::new(status))
            .expect(1)
            .mount(&mock_server)
            .await;

        let result: Result<serde_json::Value, _> = fast_client(&mock_server.uri())
            .get(INSIGHTS, RequestConfig::new())
            .await;
        let error = result.unwrap_err();
        assert_eq!(error.status(), Some(status), "status {}", status);
        assert_eq!(error.kind(), ratewise_client::ErrorKind::Permanent);
    }
}

#[tokio::test]
async fn test_rate_limit_is_not_retried() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(INSIGHTS))
        .respond_with(ResponseTemplate::new(429))
        .expect(1)
        .mount(&mock_server)
        .await;

    let retries = Arc::new(AtomicUsize::new(0));
    let result: Result<serde_json::Value, _> = fast_client(&mock_server.uri())
        .get(INSIGHTS, counting_config(&retries))
        .await;

    assert!(result.unwrap_err().is_rate_limit());
    assert_eq!(retries.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_post_is_never_retried() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(INSIGHTS))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&mock_server)
        .await;

    // Even an explicit retry policy is ignored for POST.
    let config = RequestConfig::new().with_retry(RetryConfig::new(3, 1, 5));
    let result: Result<serde_json::Value, _> = fast_client(&mock_server.uri())
        .post(INSIGHTS, &serde_json::json!({"content": "x"}), config)
        .await;
    assert!(matches!(result, Err(ApiError::ServiceUnavailable { .. })));
}

#[tokio::test]
async fn test_timeout_is_retried() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(INSIGHTS))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .expect(2)
        .mount(&mock_server)
        .await;

    let config = RequestConfig::new()
        .with_retry(RetryConfig::new(1, 1, 5))
        .with_timeout(Duration::from_millis(50));
    let result: Result<serde_json::Value, _> = fast_client(&mock_server.uri())
        .get(INSIGHTS, config)
        .await;
    assert_eq!(result.unwrap_err(), ApiError::Timeout);
}

#[tokio::test]
async fn test_cancel_during_backoff_stops_retries() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(INSIGHTS))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&mock_server)
        .await;

    let token = CancellationToken::new();
    let cancel = token.clone();
    let config = RequestConfig::new()
        .with_retry(RetryConfig::new(3, 10_000, 30_000))
        .with_cancel(token)
        .on_retry(move |_| cancel.cancel());

    let result: Result<serde_json::Value, _> = fast_client(&mock_server.uri())
        .get(INSIGHTS, config)
        .await;
    assert_eq!(result.unwrap_err(), ApiError::Cancelled);
}

#[tokio::test]
async fn test_invalid_json_is_not_retried() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(INSIGHTS))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let result: Result<serde_json::Value, _> = fast_client(&mock_server.uri())
        .get(INSIGHTS, RequestConfig::new())
        .await;
    assert!(matches!(result, Err(ApiError::InvalidResponse(_))));
}
