//! Logging configuration structures and validation logic.
//!
//! These types drive [`crate::logger::LoggerManager`]. On a single-board
//! computer running under systemd the usual setup is journald enabled with
//! console output kept for interactive runs.

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Available formats for console log output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

/// Top-level logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggerConfig {
    /// Global log level or filter directive (`info`, `debug`,
    /// `ccs_datalogger=trace`, ...). Overridden by `RUST_LOG` when set.
    #[validate(custom(function = "validate_log_level"))]
    pub level: String,

    /// Optional console output configuration.
    #[validate(nested)]
    pub console: Option<ConsoleConfig>,

    /// Optional systemd journald output configuration.
    #[validate(nested)]
    pub journald: Option<JournaldConfig>,
}

/// Validates that the level is a known severity, or a filter directive
/// whose severity parts are known.
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let known = |s: &str| {
        matches!(
            s.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error" | "off"
        )
    };

    let valid = !level.trim().is_empty()
        && level.split(',').all(|directive| {
            let severity = directive.rsplit('=').next().unwrap_or(directive);
            known(severity.trim())
        });

    if valid {
        Ok(())
    } else {
        let mut err = ValidationError::new("invalid_log_level");
        err.message = Some(format!("Invalid log level: {}", level).into());
        Err(err)
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            level: "info".to_string(),
            console: Some(ConsoleConfig::default()),
            journald: Some(JournaldConfig::default()),
        }
    }
}

/// Configuration for console log output.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Whether console output is enabled.
    pub enabled: bool,

    /// Output format for console logs.
    pub format: LogFormat,

    /// Include the log target (module path) in output.
    pub show_target: bool,

    /// Include thread IDs in output.
    pub show_thread_ids: bool,

    /// Include span close events in output.
    pub show_spans: bool,

    /// Enable ANSI color codes in console output.
    pub ansi_colors: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        ConsoleConfig {
            enabled: true,
            format: LogFormat::default(),
            show_target: false,
            show_thread_ids: false,
            show_spans: false,
            ansi_colors: true,
        }
    }
}

/// Configuration for systemd journald output.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct JournaldConfig {
    /// Whether journald output is enabled.
    pub enabled: bool,

    /// Syslog identifier attached to journal entries.
    #[validate(length(min = 1))]
    pub identifier: String,
}

impl Default for JournaldConfig {
    fn default() -> Self {
        JournaldConfig {
            enabled: false,
            identifier: "ccs-datalogger".to_string(),
        }
    }
}
