//! Application configuration.
//!
//! Component configurations live with their components; this module
//! aggregates them into a single `Config` that can be loaded from YAML
//! files or environment variables.

use serde::Deserialize;

use crate::cache::CacheConfig;
use crate::outbox::OutboxConfig;
use crate::reconciler::ReconcilerConfig;
use crate::saga::SagaConfig;
use crate::session::SessionConfig;
use crate::storage::StorageConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "keel.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "KEEL_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "KEEL";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "KEEL_LOG";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage backend configuration.
    pub storage: StorageConfig,
    /// Saga orchestrator defaults.
    pub saga: SagaConfig,
    /// Session lifecycle configuration.
    pub session: SessionConfig,
    /// Outbox relay configuration.
    pub outbox: OutboxConfig,
    /// Reconciler cadences and retentions.
    pub reconciler: ReconcilerConfig,
    /// Read-through cache configuration.
    pub cache: CacheConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (later overrides earlier):
    /// 1. `keel.yaml` in the current directory (if present)
    /// 2. File given by the `path` argument (if provided)
    /// 3. File named by `KEEL_CONFIG` (if set)
    /// 4. Environment variables with the `KEEL` prefix (`KEEL__` separator)
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}
