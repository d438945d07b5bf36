//! Process lifecycle configuration.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use validator::Validate;

use super::plugins::validate_non_zero;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ServiceConfig {
    /// How long `stop()` lets delivery workers drain before cancelling them.
    #[serde(with = "humantime_serde")]
    pub shutdown_grace_period: Duration,

    /// Period of the health snapshot (log line and optional file).
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_non_zero"))]
    pub health_interval: Duration,

    /// Optional path the JSON health report is written to on every snapshot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_file: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_period: Duration::from_secs(10),
            health_interval: Duration::from_secs(5 * 60),
            health_file: None,
        }
    }
}
