pub mod config;
pub mod error;

pub use config::{
    ApiConfig, Config, CooldownSettings, Environment, RetrySettings, ValidationResult,
};
pub use error::{
    codes, ApiError, AppError, ConfigError, ErrorKind, ReqwestErrorExt, RusqliteErrorExt,
    StorageError,
};

use anyhow::Result;

/// Initialize logging for the client
pub fn init() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    tracing::info!("Ratewise core initialized");
    Ok(())
}
