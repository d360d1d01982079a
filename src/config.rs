//! Configuration management for RateGate.
//!
//! Settings come from an optional YAML file layered with environment
//! variables prefixed `RATEGATE__`, using `__` between nesting levels, e.g.
//! `RATEGATE__RATE_LIMITING__BUCKET_IDLE_TTL_SECS=900`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{RateGateError, Result};
use crate::ratelimit::WindowConsistency;

const ENV_PREFIX: &str = "RATEGATE";
const ENV_SEPARATOR: &str = "__";

/// Main configuration for the RateGate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateGateConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// YAML seed of tenants, API keys and policies
    #[serde(default)]
    pub directory_path: Option<PathBuf>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Token buckets untouched for this long are evicted
    #[serde(default = "default_bucket_idle_ttl")]
    pub bucket_idle_ttl_secs: u64,

    /// How often the bucket sweeper runs
    #[serde(default = "default_bucket_sweep_interval")]
    pub bucket_sweep_interval_secs: u64,

    /// Read-then-append discipline for the sliding window log
    #[serde(default)]
    pub sliding_window_consistency: WindowConsistency,

    /// Usage log entries older than this are pruned
    #[serde(default = "default_usage_log_retention")]
    pub usage_log_retention_secs: u64,

    /// How often the usage log pruner runs
    #[serde(default = "default_usage_log_prune_interval")]
    pub usage_log_prune_interval_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            bucket_idle_ttl_secs: default_bucket_idle_ttl(),
            bucket_sweep_interval_secs: default_bucket_sweep_interval(),
            sliding_window_consistency: WindowConsistency::default(),
            usage_log_retention_secs: default_usage_log_retention(),
            usage_log_prune_interval_secs: default_usage_log_prune_interval(),
        }
    }
}

fn default_bucket_idle_ttl() -> u64 {
    3600
}

fn default_bucket_sweep_interval() -> u64 {
    60
}

fn default_usage_log_retention() -> u64 {
    86400
}

fn default_usage_log_prune_interval() -> u64 {
    300
}

impl RateGateConfig {
    /// Load configuration from an optional file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: RateGateConfig = builder
            .add_source(environment())
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        Self::load(Some(Path::new(path)))
    }

    /// Parse configuration from a YAML string, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RateGateConfig = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would disable a background task outright.
    pub fn validate(&self) -> Result<()> {
        let limits = &self.rate_limiting;
        let checks = [
            ("rate_limiting.bucket_idle_ttl_secs", limits.bucket_idle_ttl_secs),
            ("rate_limiting.bucket_sweep_interval_secs", limits.bucket_sweep_interval_secs),
            ("rate_limiting.usage_log_retention_secs", limits.usage_log_retention_secs),
            ("rate_limiting.usage_log_prune_interval_secs", limits.usage_log_prune_interval_secs),
        ];

        for (name, value) in checks {
            if value == 0 {
                return Err(RateGateError::Config(format!("{} must be greater than zero", name)));
            }
        }
        Ok(())
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_SEPARATOR)
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RateGateConfig::default();

        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Text);
        assert_eq!(config.rate_limiting.bucket_idle_ttl_secs, 3600);
        assert_eq!(config.rate_limiting.sliding_window_consistency, WindowConsistency::Atomic);
        assert!(config.directory_path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
logging:
  level: debug
  format: json
rate_limiting:
  bucket_idle_ttl_secs: 900
  sliding_window_consistency: parity
directory_path: /etc/rategate/tenants.yaml
"#;
        let config = RateGateConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.rate_limiting.bucket_idle_ttl_secs, 900);
        assert_eq!(config.rate_limiting.bucket_sweep_interval_secs, 60);
        assert_eq!(config.rate_limiting.sliding_window_consistency, WindowConsistency::Parity);
        assert_eq!(
            config.directory_path.as_deref(),
            Some(Path::new("/etc/rategate/tenants.yaml"))
        );
    }

    #[test]
    fn test_zero_interval_rejected() {
        let yaml = r#"
rate_limiting:
  bucket_sweep_interval_secs: 0
"#;
        assert!(matches!(
            RateGateConfig::from_yaml(yaml),
            Err(RateGateError::Config(_))
        ));
    }

    #[test]
    fn test_environment_overrides() {
        std::env::set_var("RATEGATE__RATE_LIMITING__BUCKET_IDLE_TTL_SECS", "900");
        std::env::set_var("RATEGATE__LOGGING__FORMAT", "json");

        let loaded = RateGateConfig::load(None);

        std::env::remove_var("RATEGATE__RATE_LIMITING__BUCKET_IDLE_TTL_SECS");
        std::env::remove_var("RATEGATE__LOGGING__FORMAT");

        let config = loaded.unwrap();
        assert_eq!(config.rate_limiting.bucket_idle_ttl_secs, 900);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.rate_limiting.bucket_sweep_interval_secs, 60);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(RateGateConfig::from_file("/definitely/not/here.yaml").is_err());
    }
}
