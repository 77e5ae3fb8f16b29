//! Dispatch Settings
//!
//! Ambient knobs read from the `general` section: cluster polling
//! behaviour, scheduler command timeouts and where job logs are written.

use std::path::PathBuf;
use std::time::Duration;

use once_cell::sync::Lazy;

use super::error::ConfigError;
use super::settings::Configuration;

/// Default directory for job stdout/stderr logs and cluster job scripts.
pub static DEFAULT_LOG_DIR: Lazy<PathBuf> =
    Lazy::new(|| std::env::temp_dir().join("stagerun_logs"));

/// Default interval between cluster status queries.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default number of consecutive failed status queries tolerated.
pub const DEFAULT_MAX_POLL_RETRIES: u32 = 3;

/// Default limit on a single `qsub`/`qstat`/`qdel` invocation.
pub const DEFAULT_SCHEDULER_TIMEOUT: Duration = Duration::from_secs(60);

/// Settings shared by all runners of a dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchSettings {
    /// Interval between cluster status queries
    pub poll_interval: Duration,
    /// Consecutive failed status queries before giving up
    pub max_poll_retries: u32,
    /// Longest a scheduler command may run before it is killed
    pub scheduler_timeout: Duration,
    /// Directory for job logs and generated scripts
    pub log_dir: PathBuf,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_poll_retries: DEFAULT_MAX_POLL_RETRIES,
            scheduler_timeout: DEFAULT_SCHEDULER_TIMEOUT,
            log_dir: DEFAULT_LOG_DIR.clone(),
        }
    }
}

impl DispatchSettings {
    /// Reads `general.poll_interval` and `general.scheduler_timeout`
    /// (seconds, fractional allowed), `general.max_poll_retries` and
    /// `general.log_dir`.
    pub fn from_config(config: &Configuration) -> Result<Self, ConfigError> {
        let mut settings = Self::default();

        if let Some(value) = config.get("general", "poll_interval") {
            settings.poll_interval = seconds("general.poll_interval", value)?;
        }

        if let Some(value) = config.get("general", "scheduler_timeout") {
            settings.scheduler_timeout = seconds("general.scheduler_timeout", value)?;
        }

        if let Some(value) = config.get("general", "max_poll_retries") {
            settings.max_poll_retries = value.trim().parse().map_err(|_| {
                invalid(
                    "general.max_poll_retries",
                    format!("'{}' is not a non-negative integer", value),
                )
            })?;
        }

        if let Some(value) = config.get("general", "log_dir") {
            settings.log_dir = PathBuf::from(value.trim());
        }

        Ok(settings)
    }

    /// Overrides the log directory.
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    /// Overrides the cluster polling interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Overrides the scheduler command timeout.
    pub fn with_scheduler_timeout(mut self, timeout: Duration) -> Self {
        self.scheduler_timeout = timeout;
        self
    }
}

/// Parses a positive duration in seconds.
fn seconds(key: &str, value: &str) -> Result<Duration, ConfigError> {
    let secs: f64 = value
        .trim()
        .parse()
        .map_err(|_| invalid(key, format!("'{}' is not a number of seconds", value)))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(invalid(
            key,
            format!("'{}' must be a positive number of seconds", value),
        ));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| invalid(key, format!("'{}': {}", value, e)))
}

fn invalid(key: &str, reason: String) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason,
    }
}
