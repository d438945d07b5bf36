//! Plugin manifests and the descriptors resolved from them.
//!
//! Every plugin in the plugin directory is described by one TOML file:
//!
//! ```toml
//! name = "bme280"
//! poll_interval = "60s"
//! read_timeout = "3s"
//!
//! [source]
//! builtin = "iio_environment"
//!
//! [options]
//! device = "/sys/bus/iio/devices/iio:device0"
//! ```
//!
//! or, for an external program speaking the line protocol of
//! [`super::command`]:
//!
//! ```toml
//! name = "rain_gauge"
//!
//! [source.command]
//! path = "/usr/lib/ccs-datalogger/plugins/rain_gauge"
//! args = ["--gpio", "17"]
//! ```

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use super::{error::LoadError, types::PluginOptions};
use crate::config::plugins::PluginsConfig;

/// Where a plugin's implementation comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginSource {
    /// A plugin compiled into this binary, looked up by name.
    Builtin(String),
    /// An external executable.
    Command(CommandSource),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandSource {
    pub path: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSource {
    /// Checks that the executable exists, is a regular file and, on Unix,
    /// carries an execute bit.
    pub fn validate(&self) -> Result<(), String> {
        if !self.path.is_absolute() {
            return Err(format!(
                "command path must be absolute, got '{}'",
                self.path.display()
            ));
        }
        let metadata = std::fs::metadata(&self.path)
            .map_err(|e| format!("cannot stat '{}': {}", self.path.display(), e))?;
        if !metadata.is_file() {
            return Err(format!("'{}' is not a regular file", self.path.display()));
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if metadata.permissions().mode() & 0o111 == 0 {
                return Err(format!("'{}' is not executable", self.path.display()));
            }
        }
        Ok(())
    }
}

/// On-disk manifest format.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct PluginManifest {
    name: String,
    source: PluginSource,
    #[serde(default, with = "humantime_serde")]
    poll_interval: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    read_timeout: Option<Duration>,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    options: PluginOptions,
}

const fn default_enabled() -> bool {
    true
}

/// Immutable description of one plugin, with defaults already applied.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginDescriptor {
    name: String,
    location: PathBuf,
    source: PluginSource,
    poll_interval: Duration,
    read_timeout: Duration,
    enabled: bool,
    options: PluginOptions,
}

impl PluginDescriptor {
    /// Creates a descriptor that is not backed by a manifest file.
    pub fn new(name: impl Into<String>, source: PluginSource, poll_interval: Duration) -> Self {
        Self {
            name: name.into(),
            location: PathBuf::new(),
            source,
            poll_interval,
            read_timeout: crate::config::plugins::DEFAULT_READ_TIMEOUT,
            enabled: true,
            options: PluginOptions::new(),
        }
    }

    #[must_use]
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: PluginOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Parses a manifest file, filling unset timing fields from `defaults`.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::Invalid`] naming the file stem when the file
    /// cannot be read, is not valid TOML, or carries an unusable value.
    pub fn from_manifest(path: &Path, defaults: &PluginsConfig) -> Result<Self, LoadError> {
        let label = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let raw = std::fs::read_to_string(path)
            .map_err(|e| LoadError::invalid(&label, format!("cannot read manifest: {}", e)))?;
        let manifest: PluginManifest = toml::from_str(&raw)
            .map_err(|e| LoadError::invalid(&label, format!("malformed manifest: {}", e)))?;

        let descriptor = Self {
            name: manifest.name,
            location: path.to_path_buf(),
            source: manifest.source,
            poll_interval: manifest
                .poll_interval
                .unwrap_or(defaults.poll_interval_default),
            read_timeout: manifest.read_timeout.unwrap_or(defaults.read_timeout),
            enabled: manifest.enabled,
            options: manifest.options,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Rejects names that cannot be used as file name components and zero
    /// timings.
    pub fn validate(&self) -> Result<(), LoadError> {
        let name_ok = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            && !self.name.starts_with('.');
        if !name_ok {
            return Err(LoadError::invalid(
                &self.name,
                "name must be non-empty and use only [A-Za-z0-9_.-]",
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(LoadError::invalid(&self.name, "poll_interval must be > 0"));
        }
        if self.read_timeout.is_zero() {
            return Err(LoadError::invalid(&self.name, "read_timeout must be > 0"));
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Manifest file this descriptor was read from (empty when built in code).
    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn source(&self) -> &PluginSource {
        &self.source
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn options(&self) -> &PluginOptions {
        &self.options
    }
}
