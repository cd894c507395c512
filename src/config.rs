//! Configuration for the Relay core.
//!
//! All tunables are read once at construction time and passed by value
//! into the components that need them. There is no ambient global
//! configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

/// Default seconds between runner cycles.
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 5;

/// Default retry budget per runner.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default failure count at which a breaker opens.
pub const DEFAULT_FAILURE_THRESHOLD: f64 = 5.0;

/// Default seconds a breaker stays open before probing.
pub const DEFAULT_RESET_TIMEOUT_SECS: u64 = 60;

/// Default seconds a half-open breaker waits before closing on quiet.
pub const DEFAULT_HALF_OPEN_TIMEOUT_SECS: u64 = 30;

/// Default failure-count decay per second.
pub const DEFAULT_ERROR_DECAY_RATE: f64 = 0.1;

/// Default age in seconds past which queue items are swept to the archive.
pub const DEFAULT_QUEUE_MAX_AGE_SECS: u64 = 7 * 24 * 60 * 60;

/// Default capacity of the error tracker's bounded history.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Configuration for the resilience core.
///
/// # Example
///
/// ```
/// use relay::config::RelayConfig;
///
/// let config = RelayConfig::default()
///     .with_max_retries(2)
///     .with_failure_threshold(2.0);
/// assert_eq!(config.max_retries, 2);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Seconds between runner cycles.
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Retry budget per runner before quarantine.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Failure count at which a worker's breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: f64,

    /// Seconds an open breaker waits before allowing a probe.
    #[serde(default = "default_reset_timeout")]
    pub reset_timeout_secs: u64,

    /// Seconds a half-open breaker waits (without new failures) before closing.
    #[serde(default = "default_half_open_timeout")]
    pub half_open_timeout_secs: u64,

    /// Failure-count decay per second since the last failure.
    #[serde(default = "default_error_decay_rate")]
    pub error_decay_rate: f64,

    /// Age in seconds past which `cleanup_old` archives queue items.
    #[serde(default = "default_queue_max_age")]
    pub queue_max_age_secs: u64,

    /// Capacity of the error tracker's bounded history.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Root directory for all durable state (queue, vault, metrics).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_check_interval() -> u64 {
    DEFAULT_CHECK_INTERVAL_SECS
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_failure_threshold() -> f64 {
    DEFAULT_FAILURE_THRESHOLD
}
fn default_reset_timeout() -> u64 {
    DEFAULT_RESET_TIMEOUT_SECS
}
fn default_half_open_timeout() -> u64 {
    DEFAULT_HALF_OPEN_TIMEOUT_SECS
}
fn default_error_decay_rate() -> f64 {
    DEFAULT_ERROR_DECAY_RATE
}
fn default_queue_max_age() -> u64 {
    DEFAULT_QUEUE_MAX_AGE_SECS
}
fn default_history_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}
fn default_data_dir() -> PathBuf {
    PathBuf::from(".relay")
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: DEFAULT_CHECK_INTERVAL_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout_secs: DEFAULT_RESET_TIMEOUT_SECS,
            half_open_timeout_secs: DEFAULT_HALF_OPEN_TIMEOUT_SECS,
            error_decay_rate: DEFAULT_ERROR_DECAY_RATE,
            queue_max_age_secs: DEFAULT_QUEUE_MAX_AGE_SECS,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            data_dir: default_data_dir(),
        }
    }
}

impl RelayConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the check interval in seconds.
    #[must_use]
    pub fn with_check_interval_secs(mut self, secs: u64) -> Self {
        self.check_interval_secs = secs;
        self
    }

    /// Set the retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// Set the breaker failure threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: f64) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the open-state reset timeout in seconds.
    #[must_use]
    pub fn with_reset_timeout_secs(mut self, secs: u64) -> Self {
        self.reset_timeout_secs = secs;
        self
    }

    /// Set the half-open timeout in seconds.
    #[must_use]
    pub fn with_half_open_timeout_secs(mut self, secs: u64) -> Self {
        self.half_open_timeout_secs = secs;
        self
    }

    /// Set the failure-count decay rate per second.
    #[must_use]
    pub fn with_error_decay_rate(mut self, rate: f64) -> Self {
        self.error_decay_rate = rate;
        self
    }

    /// Set the queue cleanup age in seconds.
    #[must_use]
    pub fn with_queue_max_age_secs(mut self, secs: u64) -> Self {
        self.queue_max_age_secs = secs;
        self
    }

    /// Set the error history capacity.
    #[must_use]
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    /// Set the durable-state root directory.
    #[must_use]
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Load configuration from a TOML file.
    ///
    /// Missing fields fall back to their defaults. The loaded
    /// configuration is validated before being returned.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            RelayError::config_with_path(
                format!("failed to read config: {e}"),
                path.to_path_buf(),
            )
        })?;

        let config: Self = toml::from_str(&contents).map_err(|e| {
            RelayError::config_with_path(
                format!("failed to parse config: {e}"),
                path.to_path_buf(),
            )
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.check_interval_secs == 0 {
            return Err(RelayError::invalid_config(
                "check_interval_secs",
                "must be greater than zero",
            ));
        }
        if self.failure_threshold <= 0.0 || !self.failure_threshold.is_finite() {
            return Err(RelayError::invalid_config(
                "failure_threshold",
                "must be a positive finite number",
            ));
        }
        if self.error_decay_rate < 0.0 || !self.error_decay_rate.is_finite() {
            return Err(RelayError::invalid_config(
                "error_decay_rate",
                "must be a non-negative finite number",
            ));
        }
        if self.history_capacity == 0 {
            return Err(RelayError::invalid_config(
                "history_capacity",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    /// The check interval as a `Duration`.
    #[must_use]
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    /// The open-state reset timeout as a `Duration`.
    #[must_use]
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }

    /// The half-open timeout as a `Duration`.
    #[must_use]
    pub fn half_open_timeout(&self) -> Duration {
        Duration::from_secs(self.half_open_timeout_secs)
    }

    /// The queue cleanup age as a `Duration`.
    #[must_use]
    pub fn queue_max_age(&self) -> Duration {
        Duration::from_secs(self.queue_max_age_secs)
    }
}
