use std::time::Duration;

use thiserror::Error;

/// Errors a plugin can report while initializing, sampling or shutting down.
///
/// These are always recovered locally: the sampler counts them towards
/// degradation, the registry records them, nothing crashes the service.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PluginError {
    /// The operation did not complete within its time budget.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The sensor could not be read (missing device, I/O error, plugin
    /// process failure).
    #[error("read failure: {0}")]
    ReadFailure(String),

    /// The plugin answered, but with data that is not a valid sample.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

/// Why a plugin descriptor could not be turned into a live instance.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadError {
    /// The manifest or the plugin's declared capabilities are not
    /// acceptable. The plugin is skipped.
    #[error("plugin '{plugin}' is invalid: {reason}")]
    Invalid { plugin: String, reason: String },

    /// The plugin was valid but `initialize` failed.
    #[error("plugin '{plugin}' failed to initialize: {source}")]
    InitFailure {
        plugin: String,
        #[source]
        source: PluginError,
    },
}

impl LoadError {
    pub(crate) fn invalid(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        LoadError::Invalid {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }

    /// Name of the plugin (or manifest file stem) this error refers to.
    pub fn plugin(&self) -> &str {
        match self {
            LoadError::Invalid { plugin, .. } | LoadError::InitFailure { plugin, .. } => plugin,
        }
    }
}

/// Failures of the registry itself, as opposed to individual plugins.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The plugin directory exists but cannot be listed, or cannot be created.
    #[error("Failed to read plugin directory {path}")]
    DirectoryRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
