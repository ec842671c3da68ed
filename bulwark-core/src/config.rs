//! Configuration for the resilience layer

use std::path::Path;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorRecord, Result};
use crate::executor::{ExecutorConfig, OperationKind};
use crate::logging::LoggingConfig;
use crate::resilience::circuit_breaker::CircuitBreakerConfig;
use crate::resilience::retry::{RetryConfig, RetryPolicy};
use crate::resource::{LifecycleConfig, PoolConfig};

/// Default config file, read from the working directory
pub const CONFIG_FILE: &str = "bulwark.toml";

/// Env var naming an extra config file
pub const CONFIG_PATH_ENV: &str = "BULWARK_CONFIG_PATH";

/// Prefix for env overrides; nested keys use `__`, e.g. `BULWARK_RETRY__MAX_ATTEMPTS`
pub const ENV_PREFIX: &str = "BULWARK_";

/// Main configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BulwarkConfig {
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub lifecycle: LifecycleConfig,
    pub pool: PoolConfig,
    pub executor: ExecutorConfig,
    pub logging: LoggingConfig,
}

impl BulwarkConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Loads in this order, later sources overriding earlier ones:
    /// 1. Default configuration
    /// 2. `bulwark.toml` in the working directory
    /// 3. The file named by `BULWARK_CONFIG_PATH`
    /// 4. `BULWARK_*` environment variables
    ///
    /// # Errors
    ///
    /// Returns a `Config` error if a source fails to parse or the merged
    /// result does not validate.
    pub fn load() -> Result<Self> {
        let mut figment =
            Figment::from(Serialized::defaults(BulwarkConfig::default())).merge(Toml::file(CONFIG_FILE));

        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            figment = figment.merge(Toml::file(path));
        }

        let figment = figment.merge(
            Env::prefixed(ENV_PREFIX)
                .ignore(&["CONFIG_PATH"])
                .split("__"),
        );

        Self::extract(figment)
    }

    /// Load configuration from a specific file, over the defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ErrorRecord::config(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        Self::extract(
            Figment::from(Serialized::defaults(BulwarkConfig::default())).merge(Toml::file(path)),
        )
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config: BulwarkConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no component can run with
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(ErrorRecord::config("retry.max_attempts must be at least 1"));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(ErrorRecord::config(format!(
                "retry.base_delay ({:?}) must not exceed retry.max_delay ({:?})",
                self.retry.base_delay, self.retry.max_delay
            )));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ErrorRecord::config(
                "circuit_breaker.failure_threshold must be at least 1",
            ));
        }

        self.pool.validate()?;

        let timeouts = [
            ("circuit_breaker.reset_timeout", self.circuit_breaker.reset_timeout),
            ("lifecycle.acquire_timeout", self.lifecycle.acquire_timeout),
            ("lifecycle.release_timeout", self.lifecycle.release_timeout),
            ("executor.llm_timeout", self.executor.llm_timeout),
            ("executor.tool_timeout", self.executor.tool_timeout),
            ("executor.session_timeout", self.executor.session_timeout),
            ("executor.deadline", self.executor.deadline),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, value)| value.is_zero()) {
            return Err(ErrorRecord::config(format!("{} must be greater than 0", name)));
        }

        Ok(())
    }

    /// Retry policy built from the `retry` section
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.retry)
    }

    /// Execution policy for one kind of operation
    pub fn execution_policy(&self, kind: OperationKind) -> crate::executor::ExecutionPolicy {
        self.executor.policy(kind, self.retry_policy())
    }
}
