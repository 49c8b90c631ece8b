//! Configuration management for Hivequota.

use serde::{Deserialize, Serialize};

use crate::error::{HivequotaError, Result};

/// Prefix for environment overrides, e.g. `HIVEQUOTA__STORE__BACKEND=redis`.
pub const ENV_PREFIX: &str = "HIVEQUOTA";

/// Main configuration for Hivequota.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HivequotaConfig {
    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Path to the policy table
    #[serde(default)]
    pub policy_path: Option<String>,
}

/// Which store backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store; only meaningful within one process
    #[default]
    Memory,
    /// Redis, shared by every instance
    Redis,
}

/// Shared store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Connection URL for the redis backend
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix separating this limiter's keys from other users of the store
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
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

impl HivequotaConfig {
    /// Load configuration from a file path, layered with environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        if !std::path::Path::new(path).exists() {
            return Err(HivequotaError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("configuration file {} not found", path),
            )));
        }
        Self::build(config::Config::builder().add_source(config::File::with_name(path)))
    }

    /// Load configuration from a YAML string, layered with environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::build(
            config::Config::builder()
                .add_source(config::File::from_str(yaml, config::FileFormat::Yaml)),
        )
    }

    fn build(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        let config: HivequotaConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| HivequotaError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_none() {
            return Err(HivequotaError::Config(
                "store.redis_url is required for the redis backend".into(),
            ));
        }
        if let Some(ns) = &self.store.namespace {
            if ns.is_empty() || ns.contains(':') {
                return Err(HivequotaError::Config(format!(
                    "store.namespace {:?} must be non-empty and contain no ':'",
                    ns
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HivequotaConfig::default();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
        assert!(config.policy_path.is_none());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
store:
  backend: redis
  redis_url: redis://127.0.0.1:6379/
  namespace: shop
logging:
  level: debug
  json: true
policy_path: policies.yaml
"#;
        let config = HivequotaConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.namespace.as_deref(), Some("shop"));
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
        assert_eq!(config.policy_path.as_deref(), Some("policies.yaml"));
    }

    #[test]
    fn test_redis_without_url_is_rejected() {
        let yaml = "store:\n  backend: redis\n";
        let result = HivequotaConfig::from_yaml(yaml);
        assert!(matches!(result, Err(HivequotaError::Config(_))));
    }

    #[test]
    fn test_namespace_with_separator_is_rejected() {
        let yaml = "store:\n  namespace: \"a:b\"\n";
        let result = HivequotaConfig::from_yaml(yaml);
        assert!(matches!(result, Err(HivequotaError::Config(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = HivequotaConfig::from_file("/nonexistent/hivequota.yaml");
        assert!(matches!(result, Err(HivequotaError::Io(_))));
    }
}
