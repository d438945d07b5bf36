//! Application configuration loading, validation, and management.
//!
//! The top-level [`Config`] aggregates the logging, plugin, delivery, service
//! and transport sections. It is read once from a TOML file at startup and
//! then handed by value (or behind an `Arc`) to every component that needs
//! it; nothing reads configuration from global state.
//!
//! When the configuration file does not exist yet, the defaults are written
//! to that path first so that operators get an editable template on the
//! first run.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use validator::Validate;

use self::{
    delivery::DeliveryConfig, logger::LoggerConfig, plugins::PluginsConfig,
    service::ServiceConfig, transport::TransportConfig,
};

pub mod delivery;
pub mod logger;
pub mod plugins;
pub mod service;
pub mod transport;

/// Simple macros for printing timestamped messages before the tracing subscriber
/// is initialized. These are used during early configuration loading.
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::early_timestamp()).dim(),
            console::style("INFO").green(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::early_timestamp()).dim(),
            console::style("WARN").yellow(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        eprintln!("{}  {} {}",
            console::style($crate::config::early_timestamp()).dim(),
            console::style("ERROR").red(),
            format_args!($($arg)*)
        );
    };
}

/// UTC timestamp used by the `print_*` macros.
#[doc(hidden)]
pub fn early_timestamp() -> String {
    let format = time::macros::format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
    );
    time::OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_else(|_| String::from("????-??-??T??:??:??Z"))
}

/// Errors that can occur during configuration loading, parsing, validation,
/// or serialization.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Generic configuration-related error with a descriptive message.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error while accessing configuration files.
    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    /// Failure to parse the TOML configuration file.
    #[error("Parse error while reading configuration: {0}")]
    ParseError(String),

    /// Validation failure after successful parsing.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Failure during serialization (e.g., when saving a configuration file).
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Top-level application configuration.
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct Config {
    /// Logging subsystem configuration.
    #[validate(nested)]
    pub logger: LoggerConfig,

    /// Plugin discovery, sampling and degradation settings.
    #[validate(nested)]
    pub plugins: PluginsConfig,

    /// Delivery queue retry and dead-letter settings.
    #[validate(nested)]
    pub delivery: DeliveryConfig,

    /// Process lifecycle settings.
    #[validate(nested)]
    pub service: ServiceConfig,

    /// Where readings are sent.
    #[validate(nested)]
    pub transport: TransportConfig,
}

impl Config {
    /// Loads and validates configuration from the specified path.
    ///
    /// # Errors
    ///
    /// Propagates IO, parsing, and validation errors as `ConfigError`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }

        let config_str = fs::read_to_string(path)?;
        let config = Self::parse(&config_str)?;

        print_info!("Successfully loaded config from: {}", path.display());
        Ok(config)
    }

    /// Loads the configuration, first writing the defaults to `path` when no
    /// file exists there.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the defaults cannot be written or the file
    /// cannot be loaded afterwards.
    pub fn load_or_create(path: &Path) -> Result<Config, ConfigError> {
        if !path.exists() {
            print_warn!(
                "No configuration at {}, writing defaults",
                path.display()
            );
            Config::default().save(path)?;
        }
        Self::load(path)
    }

    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `ParseError` for malformed TOML and `ValidationError` when a
    /// value is out of range.
    pub fn parse(source: &str) -> Result<Config, ConfigError> {
        let config: Config =
            toml::from_str(source).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        Ok(config)
    }

    /// Serializes this configuration as TOML and writes it to `path`,
    /// creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns `SerializationError` or `IoError`.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let rendered = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializationError(e.to_string()))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, rendered)?;
        Ok(())
    }
}
