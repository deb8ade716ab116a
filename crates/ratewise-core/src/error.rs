//! Centralized error types for the Ratewise client.
//!
//! This module provides a typed error hierarchy that:
//! - Classifies every failed request once, so retry and cooldown policy can trust it
//! - Provides user-friendly messages suitable for UI display
//! - Preserves full error context for debugging/logging

use thiserror::Error;

/// Top-level application error type.
///
/// Use `user_message()` to get a UI-appropriate message.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Returns a user-friendly message suitable for display in the UI.
    pub fn user_message(&self) -> String {
        match self {
            AppError::Api(e) => e.user_message(),
            AppError::Storage(e) => e.user_message().to_string(),
            AppError::Config(e) => e.user_message().to_string(),
            AppError::Io(_) => "A file operation failed. Please try again.".to_string(),
            AppError::Other(_) => "An unexpected error occurred. Please try again.".to_string(),
        }
    }
}

/// Handling category of a classified [`ApiError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The server (or an active cooldown) refused the request because of quota.
    RateLimited,
    /// Network failure, timeout or temporary unavailability.
    Transient,
    /// Anything retrying cannot fix.
    Permanent,
}

/// Backend error codes, matching the codes sent by the API in `error.code`.
pub mod codes {
    pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";
    pub const INVALID_LOCATION: &str = "INVALID_LOCATION";
    pub const LOCATION_NOT_FOUND: &str = "LOCATION_NOT_FOUND";
    pub const OPENWEATHER_API_ERROR: &str = "OPENWEATHER_API_ERROR";
    pub const NETWORK_ERROR: &str = "NETWORK_ERROR";
    pub const TIMEOUT_ERROR: &str = "TIMEOUT_ERROR";
    pub const INTERNAL_SERVER_ERROR: &str = "INTERNAL_SERVER_ERROR";
    pub const UNKNOWN_ERROR: &str = "UNKNOWN_ERROR";
}

/// Errors surfaced by the resilient request layer.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ApiError {
    /// The server answered 429; a cooldown has been recorded.
    #[error("Rate limited on {endpoint}, retry after {retry_after_seconds}s")]
    RateLimited {
        retry_after_seconds: u64,
        endpoint: String,
    },

    /// Rejected locally because a cooldown is active. No request was sent.
    #[error("Rate limit active on {endpoint}, wait {remaining_seconds}s")]
    PreflightBlocked {
        remaining_seconds: u64,
        endpoint: String,
    },

    #[error("Connection failed: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Service unavailable: {message}")]
    ServiceUnavailable { message: String },

    #[error("Bad request: {message}")]
    BadRequest { message: String },

    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    #[error("Not found: {message}")]
    NotFound { message: String },

    #[error("Server error: {status} - {message}")]
    Server { status: u16, message: String },

    #[error("HTTP error: {status} - {message}")]
    Http { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl ApiError {
    /// Map a non-success, non-429 HTTP status to the error taxonomy.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            400 => ApiError::BadRequest { message },
            401 => ApiError::Unauthorized { message },
            403 => ApiError::Forbidden { message },
            404 => ApiError::NotFound { message },
            503 => ApiError::ServiceUnavailable { message },
            500..=599 => ApiError::Server { status, message },
            _ => ApiError::Http { status, message },
        }
    }

    /// Handling category used by the retry engine.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::RateLimited { .. } | ApiError::PreflightBlocked { .. } => {
                ErrorKind::RateLimited
            }
            ApiError::Network(_) | ApiError::Timeout | ApiError::ServiceUnavailable { .. } => {
                ErrorKind::Transient
            }
            _ => ErrorKind::Permanent,
        }
    }

    /// True for both server-side rejections and local pre-flight blocks.
    pub fn is_rate_limit(&self) -> bool {
        self.kind() == ErrorKind::RateLimited
    }

    /// Seconds the caller should wait before trying again, if known.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            ApiError::RateLimited {
                retry_after_seconds,
                ..
            } => Some(*retry_after_seconds),
            ApiError::PreflightBlocked {
                remaining_seconds, ..
            } => Some(*remaining_seconds),
            _ => None,
        }
    }

    /// Endpoint the rate-limit error refers to.
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            ApiError::RateLimited { endpoint, .. }
            | ApiError::PreflightBlocked { endpoint, .. } => Some(endpoint),
            _ => None,
        }
    }

    /// HTTP status carried by the error, when it came from a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::RateLimited { .. } => Some(429),
            ApiError::ServiceUnavailable { .. } => Some(503),
            ApiError::BadRequest { .. } => Some(400),
            ApiError::Unauthorized { .. } => Some(401),
            ApiError::Forbidden { .. } => Some(403),
            ApiError::NotFound { .. } => Some(404),
            ApiError::Server { status, .. } | ApiError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Backend error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::RateLimited { .. } | ApiError::PreflightBlocked { .. } => {
                codes::RATE_LIMIT_EXCEEDED
            }
            ApiError::Network(_) => codes::NETWORK_ERROR,
            ApiError::Timeout => codes::TIMEOUT_ERROR,
            ApiError::ServiceUnavailable { .. } => codes::OPENWEATHER_API_ERROR,
            ApiError::BadRequest { .. } => codes::INVALID_LOCATION,
            ApiError::NotFound { .. } => codes::LOCATION_NOT_FOUND,
            ApiError::Server { status: 500, .. } => codes::INTERNAL_SERVER_ERROR,
            _ => codes::UNKNOWN_ERROR,
        }
    }

    /// Returns a user-friendly message suitable for display in the UI.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::RateLimited {
                retry_after_seconds,
                ..
            } => format!(
                "Too many requests. Please wait {} seconds and try again.",
                retry_after_seconds
            ),
            ApiError::PreflightBlocked {
                remaining_seconds, ..
            } => format!("Rate limit active. Please wait {} seconds.", remaining_seconds),
            ApiError::Network(_) => {
                "Unable to connect. Check your internet connection.".to_string()
            }
            ApiError::Timeout => {
                "The request took too long. Check your connection and try again.".to_string()
            }
            ApiError::ServiceUnavailable { .. } => {
                "Service temporarily unavailable. Please try again in a few minutes.".to_string()
            }
            ApiError::BadRequest { message } => format!("Invalid request: {}", message),
            ApiError::Unauthorized { .. } => "Authentication required.".to_string(),
            ApiError::Forbidden { .. } => {
                "You don't have permission to access this resource.".to_string()
            }
            ApiError::NotFound { .. } => "Resource not found.".to_string(),
            ApiError::Server { .. } => "Server error. Please try again.".to_string(),
            ApiError::Http { message, .. } => message.clone(),
            ApiError::InvalidResponse(_) => {
                "Received an unexpected response. Please try again.".to_string()
            }
            ApiError::InvalidRequest(message) => message.clone(),
            ApiError::Cancelled => "The request was cancelled.".to_string(),
        }
    }
}

/// Errors from a shared storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),

    #[error("Storage query failed: {0}")]
    QueryFailed(String),

    #[error("Storage quota exceeded")]
    QuotaExceeded,
}

impl StorageError {
    pub fn user_message(&self) -> &'static str {
        match self {
            StorageError::Unavailable(_) => "Local storage is unavailable.",
            StorageError::QueryFailed(_) => "A local storage operation failed.",
            StorageError::QuotaExceeded => "Local storage is full.",
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Configuration parse error: {0}")]
    ParseError(String),

    #[error("Missing required setting: {0}")]
    MissingSetting(String),
}

impl ConfigError {
    pub fn user_message(&self) -> &'static str {
        match self {
            ConfigError::NotFound(_) => "Configuration not found. Using defaults.",
            ConfigError::Invalid(_) => "Invalid configuration. Check your settings.",
            ConfigError::ParseError(_) => "Configuration file is malformed. Check your settings.",
            ConfigError::MissingSetting(_) => "A required setting is missing. Check your settings.",
        }
    }
}

/// Extension trait for converting reqwest errors to our error types.
pub trait ReqwestErrorExt {
    fn into_api_error(self) -> ApiError;
}

impl ReqwestErrorExt for reqwest::Error {
    fn into_api_error(self) -> ApiError {
        if self.is_timeout() {
            ApiError::Timeout
        } else if self.is_connect() || self.is_request() {
            ApiError::Network(self.to_string())
        } else if let Some(status) = self.status() {
            ApiError::from_status(status.as_u16(), self.to_string())
        } else if self.is_decode() || self.is_body() {
            ApiError::InvalidResponse(self.to_string())
        } else {
            ApiError::Network(self.to_string())
        }
    }
}

/// Extension trait for converting rusqlite errors to our error types.
pub trait RusqliteErrorExt {
    fn into_storage_error(self) -> StorageError;
}

impl RusqliteErrorExt for rusqlite::Error {
    fn into_storage_error(self) -> StorageError {
        match &self {
            rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::DiskFull => {
                StorageError::QuotaExceeded
            }
            rusqlite::Error::SqliteFailure(e, _)
                if matches!(
                    e.code,
                    rusqlite::ErrorCode::CannotOpen | rusqlite::ErrorCode::DatabaseBusy
                ) =>
            {
                StorageError::Unavailable(self.to_string())
            }
            _ => StorageError::QueryFailed(self.to_string()),
        }
    }
}
