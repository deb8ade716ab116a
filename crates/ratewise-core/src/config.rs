use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use url::Url;

/// Environment variable overriding `api.base_url`.
pub const API_URL_ENV: &str = "RATEWISE_API_URL";

/// Storage key holding the shared cooldown record.
pub const DEFAULT_STORAGE_KEY: &str = "rateLimitCooldown";

/// Cooldown applied when a 429 response carries no usable retry-after.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Longest cooldown a server can impose. Larger values are capped.
pub const MAX_RETRY_AFTER_SECS: u64 = 24 * 60 * 60;

/// Configuration validation errors
#[derive(Debug, Clone)]
pub struct ConfigValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Result of config validation
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationResult {
    /// Returns true if there are no errors (warnings are OK)
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Add an error
    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Add a warning
    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Get a user-friendly message summarizing all errors
    pub fn error_summary(&self) -> String {
        if self.errors.is_empty() {
            return String::new();
        }
        self.errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Application configuration directory
    pub config_dir: PathBuf,

    /// Remote API settings
    pub api: ApiConfig,

    /// Default retry policy for idempotent requests
    #[serde(default)]
    pub retry: RetrySettings,

    /// Shared cooldown settings
    #[serde(default)]
    pub cooldown: CooldownSettings,
}

/// Deployment environment; development enables per-request debug logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the remote API
    pub base_url: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub environment: Environment,
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            timeout_secs: default_timeout_secs(),
            environment: Environment::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay
    pub max_delay_ms: u64,
    /// Multiplier applied per attempt
    pub backoff_factor: f64,
    /// Relative jitter in [0, 1]; 0 disables it
    #[serde(default)]
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
            jitter: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownSettings {
    /// Key of the cooldown record in shared storage
    #[serde(default = "default_storage_key")]
    pub storage_key: String,

    /// Cooldown used when the server gives no retry-after
    #[serde(default = "default_retry_after_secs")]
    pub default_retry_after_secs: u64,

    /// SQLite file shared by every process using this profile
    #[serde(default = "default_storage_path_str")]
    pub storage_path: String,

    /// How often other processes' writes are picked up
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_storage_key() -> String {
    DEFAULT_STORAGE_KEY.to_string()
}

fn default_retry_after_secs() -> u64 {
    DEFAULT_RETRY_AFTER_SECS
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ratewise")
}

fn default_storage_path_str() -> String {
    default_config_dir()
        .join("shared_state.db")
        .to_string_lossy()
        .into_owned()
}

impl Default for CooldownSettings {
    fn default() -> Self {
        Self {
            storage_key: default_storage_key(),
            default_retry_after_secs: default_retry_after_secs(),
            storage_path: default_storage_path_str(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            api: ApiConfig::default(),
            retry: RetrySettings::default(),
            cooldown: CooldownSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from file, creating default if it doesn't exist.
    ///
    /// `RATEWISE_API_URL` overrides the configured base URL.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        let mut config = if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            config
        } else {
            let contents = std::fs::read_to_string(&config_path)
                .context("Failed to read config file")?;

            toml::from_str(&contents).context("Failed to parse config file")?
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration and validate it
    ///
    /// Returns the config along with any validation warnings.
    /// Returns an error if validation fails with critical errors.
    pub fn load_validated() -> Result<(Self, ValidationResult)> {
        let config = Self::load()?;
        let validation = config.validate();

        if !validation.is_valid() {
            anyhow::bail!(
                "Configuration validation failed: {}",
                validation.error_summary()
            );
        }

        for warning in &validation.warnings {
            tracing::warn!("Config warning: {}", warning);
        }

        Ok((config, validation))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(API_URL_ENV) {
            if !url.trim().is_empty() {
                tracing::debug!("Using API URL from {}", API_URL_ENV);
                self.api.base_url = url;
            }
        }
    }

    /// Validate the configuration
    ///
    /// Returns a ValidationResult containing any errors or warnings.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        self.validate_url(&self.api.base_url, "api.base_url", &mut result);

        if self.api.timeout_secs == 0 {
            result.add_error("api.timeout_secs", "Timeout must be greater than 0");
        } else if self.api.timeout_secs > 300 {
            result.add_warning("api.timeout_secs", "Timeout is unusually long (>300s)");
        }

        if self.retry.backoff_factor < 1.0 {
            result.add_error(
                "retry.backoff_factor",
                "Backoff factor must be at least 1.0",
            );
        }

        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            result.add_error(
                "retry.initial_delay_ms",
                "Initial delay cannot exceed max delay",
            );
        }

        if !(0.0..=1.0).contains(&self.retry.jitter) {
            result.add_error("retry.jitter", "Jitter must be between 0.0 and 1.0");
        }

        if self.retry.max_retries > 10 {
            result.add_warning(
                "retry.max_retries",
                "More than 10 retries will keep failed requests alive for a long time",
            );
        }

        if self.cooldown.storage_key.trim().is_empty() {
            result.add_error("cooldown.storage_key", "Storage key cannot be empty");
        }

        if self.cooldown.default_retry_after_secs == 0 {
            result.add_error(
                "cooldown.default_retry_after_secs",
                "Default retry-after must be greater than 0",
            );
        }

        if self.cooldown.poll_interval_ms == 0 {
            result.add_error(
                "cooldown.poll_interval_ms",
                "Poll interval must be greater than 0",
            );
        } else if self.cooldown.poll_interval_ms > 5000 {
            result.add_warning(
                "cooldown.poll_interval_ms",
                "Other processes will see new cooldowns more than 5s late",
            );
        }

        result
    }

    /// Validate a URL field
    fn validate_url(&self, url_str: &str, field_name: &str, result: &mut ValidationResult) {
        match Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    result.add_error(
                        field_name,
                        format!("URL must use http or https scheme, got: {}", url.scheme()),
                    );
                }

                if url.host().is_none() {
                    result.add_error(field_name, "URL must have a host");
                }

                if url.port() == Some(0) {
                    result.add_error(field_name, "Port cannot be 0");
                }
            }
            Err(e) => {
                result.add_error(field_name, format!("Invalid URL: {}", e));
            }
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Get the path to the configuration file
    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("ratewise");

        Ok(config_dir.join("config.toml"))
    }
}
