//! Configuration for workflow persistence
//!
//! Loaded in layers: built-in defaults, then an optional file, then
//! `WORKFLOW_STORE_*` environment variables (nested keys joined with `__`,
//! e.g. `WORKFLOW_STORE_CONCURRENCY__LOCK_TIMEOUT_MS=500`).

use crate::{PersistenceError, PersistenceResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level persistence configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PersistenceConfig {
    /// In-memory store sizing
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Concurrency controller settings
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    /// Instance id allocation
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// In-memory store sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MemoryConfig {
    /// Instances to reserve room for up front
    #[serde(default)]
    pub initial_capacity: usize,

    /// Number of map shards; 0 uses the dashmap default
    #[serde(default)]
    pub shard_amount: usize,
}

/// Concurrency controller settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Longest wait for a single instance's lock before giving up
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl ConcurrencyConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// How new instance ids are produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IdentityStrategy {
    /// Random UUID v4
    #[default]
    Uuid,
    /// `{prefix}-{n}` from a counter
    Sequential,
}

/// Instance id allocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default)]
    pub strategy: IdentityStrategy,

    /// Prefix for sequential ids
    #[serde(default = "default_id_prefix")]
    pub prefix: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            strategy: IdentityStrategy::Uuid,
            prefix: default_id_prefix(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
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

// Default value helpers
fn default_lock_timeout_ms() -> u64 {
    250
}

fn default_id_prefix() -> String {
    "wf".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl PersistenceConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&str>) -> PersistenceResult<Self> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&PersistenceConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("WORKFLOW_STORE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the store cannot run with
    pub fn validate(&self) -> PersistenceResult<()> {
        let shards = self.memory.shard_amount;
        if shards != 0 && (shards < 2 || !shards.is_power_of_two()) {
            return Err(PersistenceError::InvalidInput(format!(
                "memory.shard_amount must be 0 or a power of two greater than 1, got {shards}"
            )));
        }
        if self.concurrency.lock_timeout_ms == 0 {
            return Err(PersistenceError::InvalidInput(
                "concurrency.lock_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.identity.strategy == IdentityStrategy::Sequential
            && self.identity.prefix.is_empty()
        {
            return Err(PersistenceError::InvalidInput(
                "identity.prefix must not be empty for sequential ids".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PersistenceConfig::default();
        assert_eq!(config.concurrency.lock_timeout(), Duration::from_millis(250));
        assert_eq!(config.identity.strategy, IdentityStrategy::Uuid);
        assert_eq!(config.identity.prefix, "wf");
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_shard_amount() {
        let mut config = PersistenceConfig::default();
        config.memory.shard_amount = 16;
        assert!(config.validate().is_ok());

        config.memory.shard_amount = 12;
        assert!(matches!(
            config.validate(),
            Err(PersistenceError::InvalidInput(_))
        ));

        config.memory.shard_amount = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_timeout_and_prefix() {
        let mut config = PersistenceConfig::default();
        config.concurrency.lock_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = PersistenceConfig::default();
        config.identity.strategy = IdentityStrategy::Sequential;
        config.identity.prefix.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let config: PersistenceConfig = serde_json::from_value(serde_json::json!({
            "identity": { "strategy": "sequential" }
        }))
        .unwrap();

        assert_eq!(config.identity.strategy, IdentityStrategy::Sequential);
        assert_eq!(config.identity.prefix, "wf");
        assert_eq!(config.concurrency.lock_timeout_ms, 250);
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!(
            "workflow-store-{}.toml",
            uuid::Uuid::new_v4()
        ));
        std::fs::write(
            &path,
            "[concurrency]\nlock_timeout_ms = 900\n\n[identity]\nstrategy = \"sequential\"\nprefix = \"run\"\n",
        )
        .unwrap();

        let config = PersistenceConfig::load(path.to_str()).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.concurrency.lock_timeout_ms, 900);
        assert_eq!(config.identity.strategy, IdentityStrategy::Sequential);
        assert_eq!(config.identity.prefix, "run");
        assert!(!config.logging.json);
    }

    #[test]
    fn test_load_env_override() {
        std::env::set_var("WORKFLOW_STORE_LOGGING__LEVEL", "trace");
        let loaded = PersistenceConfig::load(None);
        std::env::remove_var("WORKFLOW_STORE_LOGGING__LEVEL");

        let config = loaded.unwrap();
        assert_eq!(config.logging.level, "trace");
        assert_eq!(config.concurrency.lock_timeout_ms, 250);
    }

    #[test]
    fn test_load_without_file() {
        let config = PersistenceConfig::load(Some("does-not-exist/workflow-store")).unwrap();
        assert_eq!(config.memory, MemoryConfig::default());
    }
}
