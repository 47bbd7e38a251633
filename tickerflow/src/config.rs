//! Orchestrator configuration.
//!
//! Loaded in layers: built-in defaults, an optional `tickerflow.{toml,json,yaml}`
//! file, then `TICKERFLOW__*` environment variables
//! (e.g. `TICKERFLOW__RETRY__MAX_ATTEMPTS=5`).

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::pipeline::RetryPolicy;

/// Configuration loading or validation failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A source could not be read or deserialized.
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// Values were read but are inconsistent.
    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Logging output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Settings for [`Orchestrator`](crate::pipeline::Orchestrator) runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Retry policy for stage functions.
    pub retry: RetryPolicy,
    /// Symbols processed at once within a stage.
    pub max_concurrency: usize,
    /// Timeout for each stage function invocation, unless the stage sets one.
    pub stage_timeout_ms: Option<u64>,
    /// Database file opened by `SqliteStore::from_config`; in-memory when unset.
    pub sqlite_path: Option<PathBuf>,
    /// Logging settings.
    pub logging: LoggingConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_concurrency: 1,
            stage_timeout_ms: None,
            sqlite_path: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Loads configuration from the current directory and environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source is malformed or validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(".")
    }

    /// Loads configuration from `config_dir/tickerflow.*` and environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source is malformed or validation fails.
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let file = config_dir.as_ref().join("tickerflow");
        let loaded: Self = Config::builder()
            .add_source(File::with_name(&file.to_string_lossy()).required(false))
            .add_source(
                Environment::with_prefix("TICKERFLOW")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        loaded.validate()?;
        Ok(loaded)
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the per-stage symbol concurrency.
    #[must_use]
    pub const fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Sets the default stage function timeout.
    #[must_use]
    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Returns the default stage function timeout.
    #[must_use]
    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_ms.map(Duration::from_millis)
    }

    /// Validates configuration values.
    ///
    /// # Errors
    ///
    /// Returns every problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if let Err(e) = self.retry.validate() {
            errors.push(format!("retry: {e}"));
        }
        if self.max_concurrency == 0 {
            errors.push("max_concurrency must be >= 1".to_string());
        }
        if self.stage_timeout_ms == Some(0) {
            errors.push("stage_timeout_ms must be positive when set".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }
}
