//! Configuration management for Fairgate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

/// Environment variable prefix for configuration overrides.
const ENV_PREFIX: &str = "FAIRGATE";

/// Main configuration for a Fairgate evaluator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FairgateConfig {
    /// Backing store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Priority fairness configuration
    #[serde(default)]
    pub fairness: FairnessConfig,

    /// Limit file configuration
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Backing store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Key prefix shared by every record this deployment writes
    #[serde(default = "default_scope")]
    pub scope: String,

    /// Upper bound on a single store round trip, in milliseconds
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    /// Idle time after which the in-memory store evicts a bucket, in seconds
    #[serde(default = "default_idle_eviction")]
    pub idle_eviction_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            scope: default_scope(),
            operation_timeout_ms: default_operation_timeout(),
            idle_eviction_secs: default_idle_eviction(),
        }
    }
}

impl StoreConfig {
    /// The operation timeout as a `Duration`.
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// The idle eviction threshold as a `Duration`.
    pub fn idle_eviction(&self) -> Duration {
        Duration::from_secs(self.idle_eviction_secs)
    }
}

fn default_scope() -> String {
    "fairgate".to_string()
}

fn default_operation_timeout() -> u64 {
    250
}

fn default_idle_eviction() -> u64 {
    3600
}

/// Priority fairness configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FairnessConfig {
    /// Length of one fairness evaluation window, in milliseconds
    #[serde(default = "default_window")]
    pub window_ms: u64,

    /// Half-life of the observed-throttle signal, in milliseconds
    #[serde(default = "default_throttle_half_life")]
    pub throttle_half_life_ms: u64,
}

impl Default for FairnessConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window(),
            throttle_half_life_ms: default_throttle_half_life(),
        }
    }
}

impl FairnessConfig {
    /// The throttle signal half-life as a `Duration`.
    pub fn throttle_half_life(&self) -> Duration {
        Duration::from_millis(self.throttle_half_life_ms)
    }
}

fn default_window() -> u64 {
    1000
}

fn default_throttle_half_life() -> u64 {
    5000
}

/// Limit file configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Path to the limit configuration YAML file
    pub path: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl FairgateConfig {
    /// Load configuration from an optional file, overlaid with `FAIRGATE__*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let config = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Load configuration from a file path, without environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = FairgateConfig::default();
        assert_eq!(config.store.scope, "fairgate");
        assert_eq!(config.store.operation_timeout(), Duration::from_millis(250));
        assert_eq!(config.fairness.window_ms, 1000);
        assert_eq!(config.logging.level, "info");
        assert!(config.limits.path.is_none());
    }

    #[test]
    fn test_from_file_partial_yaml() {
        let dir = std::env::temp_dir().join(format!("fairgate-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("fairgate.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "store:\n  scope: jobs\nfairness:\n  window_ms: 500\nlimits:\n  path: /etc/fairgate/limits.yaml"
        )
        .unwrap();

        let config = FairgateConfig::from_file(&path).unwrap();
        assert_eq!(config.store.scope, "jobs");
        assert_eq!(config.store.operation_timeout_ms, 250);
        assert_eq!(config.fairness.window_ms, 500);
        assert_eq!(config.fairness.throttle_half_life_ms, 5000);
        assert_eq!(config.limits.path.as_deref(), Some("/etc/fairgate/limits.yaml"));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let result = FairgateConfig::from_file("/nonexistent/fairgate.yaml");
        assert!(matches!(result, Err(crate::error::FairgateError::Config(_))));
    }
}
