//! Layered configuration for Hypnos
//!
//! Sources, lowest precedence first:
//! 1. Built-in defaults
//! 2. TOML file (`--config` or `$XDG_CONFIG_HOME/hypnos/config.toml`)
//! 3. Environment variables `HYPNOS__SECTION__KEY`
//!    (e.g. `HYPNOS__WORKER__CONSOLIDATION__BATCH_SIZE=10`)
//!
//! CLI flags are applied on top by the binary. The Anthropic API key is only
//! ever read from `ANTHROPIC_API_KEY` and is never written out.

use crate::error::{HypnosError, Result};
use crate::evolution::EvolutionConfig;
use crate::services::LlmConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable prefix for overrides
const ENV_PREFIX: &str = "HYPNOS";

/// Default database location following the XDG data directory
pub fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hypnos")
        .join("hypnos.db")
}

/// Default config file location
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hypnos")
        .join("config.toml")
}

/// Storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Local database file, or a `libsql://` URL for a remote database
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_db_path().to_string_lossy().to_string(),
        }
    }
}

/// Complete Hypnos configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HypnosConfig {
    pub storage: StorageConfig,
    pub oracle: LlmConfig,
    pub worker: EvolutionConfig,
}

impl HypnosConfig {
    /// Load defaults, then `file` (if it exists), then environment overrides
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&HypnosConfig::default()).map_err(config_error)?;

        let mut builder = config::Config::builder().add_source(defaults);

        let file = file.map(Path::to_path_buf).unwrap_or_else(default_config_path);
        if file.exists() {
            debug!("Loading configuration from {}", file.display());
            builder = builder.add_source(config::File::from(file.as_path()));
        }

        let merged = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(config_error)?;

        let mut config: HypnosConfig = merged.try_deserialize().map_err(config_error)?;
        config.oracle.api_key = std::env::var("ANTHROPIC_API_KEY").unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    /// Parse a complete configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: HypnosConfig =
            toml::from_str(text).map_err(|e| HypnosError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML (without secrets)
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| HypnosError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.path.trim().is_empty() {
            return Err(HypnosError::Config("storage.path must not be empty".to_string()));
        }
        if self.oracle.max_tokens == 0 {
            return Err(HypnosError::Config("oracle.max_tokens must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.oracle.temperature) {
            return Err(HypnosError::Config(
                "oracle.temperature must be within [0, 1]".to_string(),
            ));
        }
        self.worker
            .validate()
            .map_err(|e| HypnosError::Config(e.to_string()))
    }
}

fn config_error(err: config::ConfigError) -> HypnosError {
    HypnosError::Config(err.to_string())
}
