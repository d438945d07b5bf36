//! Configuration for plugin discovery and the sampling schedule.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Default poll period between two samples of a plugin (30 minutes).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Default upper bound for a single `read_sample` call.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings shared by the plugin registry and the sampler.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PluginsConfig {
    /// Directory scanned for `*.toml` plugin manifests.
    pub directory: PathBuf,

    /// Poll interval for plugins whose manifest does not set one.
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_non_zero"))]
    pub poll_interval_default: Duration,

    /// Upper bound for `read_sample`; exceeding it counts as a timeout.
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_non_zero"))]
    pub read_timeout: Duration,

    /// Consecutive read failures after which a plugin becomes degraded.
    #[validate(range(min = 1, message = "At least one failure must be tolerated"))]
    pub max_consecutive_failures: u32,

    /// Multiplier applied to the poll interval of a degraded plugin.
    #[validate(range(min = 1.0, message = "Backoff factor must be at least 1.0"))]
    pub backoff_factor: f64,

    /// Longest poll interval a degraded plugin may back off to.
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_non_zero"))]
    pub backoff_cap: Duration,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("/etc/ccs-datalogger/plugins"),
            poll_interval_default: DEFAULT_POLL_INTERVAL,
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_consecutive_failures: 5,
            backoff_factor: 2.0,
            backoff_cap: Duration::from_secs(6 * 60 * 60),
        }
    }
}

/// Rejects zero durations; a zero period would spin a task.
pub(crate) fn validate_non_zero(value: &Duration) -> Result<(), ValidationError> {
    if value.is_zero() {
        let mut err = ValidationError::new("zero_duration");
        err.message = Some("Duration must be greater than zero".into());
        Err(err)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(PluginsConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let config = PluginsConfig {
            poll_interval_default: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_failure_threshold_is_rejected() {
        let config = PluginsConfig {
            max_consecutive_failures: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
