// Evolution Configuration
//
// Defines configuration for the background sleep and think cycles including
// scheduling intervals, batch sizes, trigger thresholds and retry bounds.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main evolution configuration
///
/// Missing sections fall back to their defaults; a job section that is
/// present must be complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionConfig {
    /// Enable/disable both background cycles
    pub enabled: bool,

    /// Upper bound on a single oracle call
    #[serde(with = "serde_duration", default = "default_oracle_timeout")]
    pub oracle_timeout: Duration,

    /// Consecutive failed runs before a job reports degraded mode
    #[serde(default = "default_degraded_after")]
    pub degraded_after: u32,

    /// How long shutdown waits for in-flight runs
    #[serde(with = "serde_duration", default = "default_shutdown_grace")]
    pub shutdown_grace: Duration,

    /// Sleep cycle (consolidation) job configuration
    pub consolidation: JobConfig,

    /// Think cycle job configuration; `batch_size` is the max tasks per tick
    pub think: JobConfig,

    /// Consolidation-specific settings
    #[serde(default)]
    pub sleep: SleepConfig,
}

/// Configuration for individual periodic jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Enable/disable this specific job
    pub enabled: bool,

    /// Interval between job runs (in seconds)
    #[serde(with = "serde_duration")]
    pub interval: Duration,

    /// Maximum number of records to process per run
    pub batch_size: usize,
}

/// Sleep cycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SleepConfig {
    /// Active working-layer count that triggers a cycle
    pub working_threshold: usize,

    /// Expired-status count that triggers a cycle
    pub expired_threshold: usize,

    /// Passes without a valid decision before a record is force-archived
    pub max_retries: u32,

    /// ttl granted by an `extend` decision (in seconds)
    #[serde(with = "serde_duration")]
    pub extend_window: Duration,

    /// Reviewer tag written to the review log
    pub reviewer: String,
}

impl Default for SleepConfig {
    fn default() -> Self {
        Self {
            working_threshold: 300,
            expired_threshold: 50,
            max_retries: 3,
            extend_window: Duration::from_secs(7 * 24 * 3600), // 7 days
            reviewer: "sleep_cycle".to_string(),
        }
    }
}

fn default_oracle_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_degraded_after() -> u32 {
    3
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(30)
}

// Custom serde module for Duration (serialize/deserialize as seconds)
pub(crate) mod serde_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            oracle_timeout: default_oracle_timeout(),
            degraded_after: default_degraded_after(),
            shutdown_grace: default_shutdown_grace(),
            consolidation: JobConfig {
                enabled: true,
                interval: Duration::from_secs(1800), // 30 minutes
                batch_size: 20,
            },
            think: JobConfig {
                enabled: true,
                interval: Duration::from_secs(900), // 15 minutes
                batch_size: 3,
            },
            sleep: SleepConfig::default(),
        }
    }
}

impl EvolutionConfig {
    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: EvolutionConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_job_config("consolidation", &self.consolidation)?;
        self.validate_job_config("think", &self.think)?;

        if self.sleep.max_retries == 0 {
            return Err(ConfigError::ValidationError(
                "sleep: max_retries must be at least 1".to_string(),
            ));
        }

        if self.sleep.working_threshold == 0 || self.sleep.expired_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "sleep: trigger thresholds must be positive".to_string(),
            ));
        }

        if self.sleep.extend_window.is_zero() {
            return Err(ConfigError::ValidationError(
                "sleep: extend_window must be positive".to_string(),
            ));
        }

        if self.oracle_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "oracle_timeout must be positive".to_string(),
            ));
        }

        Ok(())
    }

    fn validate_job_config(&self, name: &str, config: &JobConfig) -> Result<(), ConfigError> {
        if config.interval.is_zero() {
            return Err(ConfigError::ValidationError(format!(
                "{}: interval must be positive",
                name
            )));
        }

        if config.batch_size == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{}: batch_size must be positive",
                name
            )));
        }

        if config.batch_size > 1000 {
            return Err(ConfigError::ValidationError(format!(
                "{}: batch_size must not exceed 1000",
                name
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EvolutionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.consolidation.interval, Duration::from_secs(1800));
        assert_eq!(config.think.interval, Duration::from_secs(900));
        assert_eq!(config.consolidation.batch_size, 20);
        assert_eq!(config.think.batch_size, 3);
        assert_eq!(config.sleep.working_threshold, 300);
        assert_eq!(config.sleep.expired_threshold, 50);
    }

    #[test]
    fn test_from_toml_with_defaults() {
        let toml = r#"
            enabled = true

            [consolidation]
            enabled = true
            interval = 600
            batch_size = 10

            [think]
            enabled = false
            interval = 300
            batch_size = 5
        "#;

        let config = EvolutionConfig::from_toml(toml).unwrap();
        assert_eq!(config.consolidation.interval, Duration::from_secs(600));
        assert!(!config.think.enabled);
        assert_eq!(config.sleep.max_retries, 3);
        assert_eq!(config.oracle_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut config = EvolutionConfig::default();
        config.think.batch_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_zero_retries_rejected() {
        let mut config = EvolutionConfig::default();
        config.sleep.max_retries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serialization_round_trip_keeps_seconds() {
        let config = EvolutionConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        assert!(toml_str.contains("interval = 1800"));
        let parsed = EvolutionConfig::from_toml(&toml_str).unwrap();
        assert_eq!(parsed.sleep.extend_window, config.sleep.extend_window);
    }
}
