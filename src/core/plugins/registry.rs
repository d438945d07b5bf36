//! Plugin discovery, loading and ownership.
//!
//! Builtin plugins are submitted to a link-time inventory with
//! [`register_plugin!`](crate::register_plugin). Everything else is
//! described by manifests in the plugin directory and resolved here into
//! live [`PluginInstance`]s. The registry is the only owner of instances;
//! the sampler only ever holds [`Weak`](std::sync::Weak) references.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{debug, info, warn};

use super::{
    command::CommandPlugin,
    descriptor::{PluginDescriptor, PluginSource},
    error::{LoadError, PluginError, RegistryError},
    traits::{PluginHandle, SensorPlugin},
    types::{Capability, PluginIdentity},
};
use crate::config::plugins::PluginsConfig;

/// Link-time registration record of a builtin plugin.
pub struct BuiltinPlugin {
    pub name: &'static str,
    pub factory: fn() -> Arc<dyn SensorPlugin>,
}

inventory::collect!(BuiltinPlugin);

/// Names of all builtin plugins compiled into this binary, sorted.
pub fn builtin_names() -> Vec<&'static str> {
    let mut names: Vec<_> = inventory::iter::<BuiltinPlugin>
        .into_iter()
        .map(|b| b.name)
        .collect();
    names.sort_unstable();
    names
}

/// A loaded, validated plugin.
pub struct PluginInstance {
    descriptor: PluginDescriptor,
    identity: PluginIdentity,
    handle: Box<dyn PluginHandle>,
}

impl PluginInstance {
    /// The descriptor name, which is the key used by the sampler, the
    /// delivery queue and the health report.
    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    /// Identity reported by the plugin when it was loaded.
    pub fn identity(&self) -> &PluginIdentity {
        &self.identity
    }

    pub fn handle(&self) -> &dyn PluginHandle {
        self.handle.as_ref()
    }
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("name", &self.name())
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

/// A plugin whose `shutdown` failed during [`PluginRegistry::unload_all`].
#[derive(Debug, Clone, PartialEq)]
pub struct ShutdownFailure {
    pub plugin: String,
    pub error: PluginError,
}

pub struct PluginRegistry {
    config: PluginsConfig,
    builtins: HashMap<String, Arc<dyn SensorPlugin>>,
    instances: Vec<Arc<PluginInstance>>,
    disabled: Vec<PluginDescriptor>,
    failures: Vec<LoadError>,
    shutdown_failures: Vec<ShutdownFailure>,
}

impl PluginRegistry {
    /// Creates a registry seeded with every builtin from the inventory.
    pub fn new(config: PluginsConfig) -> Self {
        let builtins = inventory::iter::<BuiltinPlugin>
            .into_iter()
            .map(|b| (b.name.to_string(), (b.factory)()))
            .collect();

        Self {
            config,
            builtins,
            instances: Vec::new(),
            disabled: Vec::new(),
            failures: Vec::new(),
            shutdown_failures: Vec::new(),
        }
    }

    /// Adds or replaces a builtin plugin kind at runtime.
    pub fn register_builtin(&mut self, name: impl Into<String>, plugin: Arc<dyn SensorPlugin>) {
        self.builtins.insert(name.into(), plugin);
    }

    pub fn has_builtin(&self, name: &str) -> bool {
        self.builtins.contains_key(name)
    }

    pub fn config(&self) -> &PluginsConfig {
        &self.config
    }

    /// Reads every `*.toml` manifest in `dir`, in lexicographic file name
    /// order. Manifests that cannot be parsed are recorded as
    /// [`LoadError::Invalid`] and skipped. A missing directory is created and
    /// yields no descriptors.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DirectoryRead`] when the directory can
    /// neither be listed nor created.
    pub async fn discover(&mut self, dir: &Path) -> Result<Vec<PluginDescriptor>, RegistryError> {
        let dir_err = |source: std::io::Error| RegistryError::DirectoryRead {
            path: dir.display().to_string(),
            source,
        };

        if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
            info!(directory = %dir.display(), "Plugin directory missing, creating it");
            tokio::fs::create_dir_all(dir).await.map_err(dir_err)?;
            return Ok(Vec::new());
        }

        let mut entries = tokio::fs::read_dir(dir).await.map_err(dir_err)?;
        let mut manifests: Vec<PathBuf> = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(dir_err)? {
            let path = entry.path();
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if is_file && path.extension().is_some_and(|ext| ext == "toml") {
                manifests.push(path);
            }
        }
        manifests.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

        let mut descriptors = Vec::with_capacity(manifests.len());
        for path in manifests {
            match PluginDescriptor::from_manifest(&path, &self.config) {
                Ok(descriptor) => {
                    debug!(plugin = %descriptor.name(), manifest = %path.display(), "Discovered plugin");
                    descriptors.push(descriptor);
                }
                Err(e) => {
                    warn!(manifest = %path.display(), "Skipping plugin manifest: {}", e);
                    self.failures.push(e);
                }
            }
        }

        info!(
            directory = %dir.display(),
            count = descriptors.len(),
            "Plugin discovery finished"
        );
        Ok(descriptors)
    }

    /// Turns a descriptor into a live instance and takes ownership of it.
    ///
    /// # Errors
    ///
    /// [`LoadError::Invalid`] when the descriptor, its source or the
    /// plugin's declared identity is unusable, or the name is already
    /// loaded. [`LoadError::InitFailure`] when `initialize` fails or exceeds
    /// the read timeout.
    pub async fn load(&mut self, descriptor: PluginDescriptor) -> Result<Arc<PluginInstance>, LoadError> {
        let name = descriptor.name().to_string();

        if self.get(&name).is_some() {
            return Err(LoadError::invalid(&name, "a plugin with this name is already loaded"));
        }
        descriptor.validate()?;

        let plugin = self.resolve(&descriptor)?;
        let timeout = descriptor.read_timeout();

        let handle = match tokio::time::timeout(timeout, plugin.initialize(descriptor.options())).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(source)) => return Err(LoadError::InitFailure { plugin: name, source }),
            Err(_) => {
                return Err(LoadError::InitFailure {
                    plugin: name,
                    source: PluginError::Timeout(timeout),
                })
            }
        };

        let identity = handle.identify();
        let rejection = if identity.name.trim().is_empty() {
            Some("plugin reported an empty name".to_string())
        } else {
            let missing = identity.missing_capabilities();
            (!missing.is_empty()).then(|| format!("missing required capabilities {:?}", missing))
        };

        if let Some(reason) = rejection {
            if identity.supports(Capability::Shutdown) {
                let _ = tokio::time::timeout(timeout, handle.shutdown()).await;
            }
            return Err(LoadError::invalid(&name, reason));
        }

        info!(
            plugin = %name,
            kind = %identity.name,
            version = %identity.version,
            interval = ?descriptor.poll_interval(),
            "Plugin loaded"
        );

        let instance = Arc::new(PluginInstance {
            descriptor,
            identity,
            handle,
        });
        self.instances.push(Arc::clone(&instance));
        Ok(instance)
    }

    fn resolve(&self, descriptor: &PluginDescriptor) -> Result<Arc<dyn SensorPlugin>, LoadError> {
        match descriptor.source() {
            PluginSource::Builtin(kind) => self.builtins.get(kind).cloned().ok_or_else(|| {
                LoadError::invalid(
                    descriptor.name(),
                    format!("unknown builtin plugin '{}'", kind),
                )
            }),
            PluginSource::Command(command) => {
                command
                    .validate()
                    .map_err(|reason| LoadError::invalid(descriptor.name(), reason))?;
                Ok(Arc::new(CommandPlugin::new(
                    command.path.clone(),
                    command.args.clone(),
                    descriptor.read_timeout(),
                )))
            }
        }
    }

    /// Loads every descriptor, isolating failures. Disabled descriptors are
    /// kept aside without being initialized. Returns the number of plugins
    /// loaded by this call.
    pub async fn load_all(&mut self, descriptors: Vec<PluginDescriptor>) -> usize {
        let mut loaded = 0;
        for descriptor in descriptors {
            if !descriptor.enabled() {
                info!(plugin = %descriptor.name(), "Plugin disabled by manifest");
                self.disabled.push(descriptor);
                continue;
            }
            match self.load(descriptor).await {
                Ok(_) => loaded += 1,
                Err(e) => {
                    warn!(plugin = %e.plugin(), "Plugin not loaded: {}", e);
                    self.failures.push(e);
                }
            }
        }
        loaded
    }

    pub fn get(&self, name: &str) -> Option<&Arc<PluginInstance>> {
        self.instances.iter().find(|i| i.name() == name)
    }

    /// Loaded instances, in load order.
    pub fn instances(&self) -> &[Arc<PluginInstance>] {
        &self.instances
    }

    /// Descriptors with `enabled = false`.
    pub fn disabled(&self) -> &[PluginDescriptor] {
        &self.disabled
    }

    /// Every manifest or load failure recorded so far.
    pub fn failures(&self) -> &[LoadError] {
        &self.failures
    }

    pub fn shutdown_failures(&self) -> &[ShutdownFailure] {
        &self.shutdown_failures
    }

    /// Calls `shutdown` on every instance and releases them. Individual
    /// failures are logged and recorded, never propagated.
    pub async fn unload_all(&mut self) -> Vec<ShutdownFailure> {
        let mut failures = Vec::new();

        for instance in std::mem::take(&mut self.instances) {
            let name = instance.name().to_string();
            let timeout = instance.descriptor().read_timeout();

            let result = match tokio::time::timeout(timeout, instance.handle().shutdown()).await {
                Ok(result) => result,
                Err(_) => Err(PluginError::Timeout(timeout)),
            };

            match result {
                Ok(()) => debug!(plugin = %name, "Plugin shut down"),
                Err(error) => {
                    warn!(plugin = %name, "Plugin shutdown failed: {}", error);
                    failures.push(ShutdownFailure {
                        plugin: name,
                        error,
                    });
                }
            }
        }

        self.shutdown_failures.extend(failures.iter().cloned());
        failures
    }
}

/// Registers a builtin plugin type under a name.
///
/// The type must implement [`SensorPlugin`] and [`Default`].
#[macro_export]
macro_rules! register_plugin {
    ($plugin_type:ty, $name:expr) => {
        inventory::submit! {
            $crate::core::plugins::registry::BuiltinPlugin {
                name: $name,
                factory: || std::sync::Arc::new(<$plugin_type>::default()),
            }
        }
    };
}
