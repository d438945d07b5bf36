use super::types::{PluginIdentity, PluginOptions, PluginResult, Sample};

/// Entry point every sensor plugin exposes.
///
/// A plugin is a factory: `initialize` opens whatever the sensor needs
/// (device files, a helper process, a bus handle) and returns a live
/// [`PluginHandle`]. The registry only ever talks to plugins through these
/// two traits and the capabilities declared by [`PluginHandle::identify`];
/// it never inspects the concrete type.
#[async_trait::async_trait]
pub trait SensorPlugin: Send + Sync + 'static {
    /// Prepares the sensor using the options from the plugin's manifest.
    async fn initialize(&self, options: &PluginOptions) -> PluginResult<Box<dyn PluginHandle>>;
}

/// A live, initialized plugin.
///
/// Handles are shared between the registry (owner) and the sampler, so all
/// methods take `&self`; implementations that keep mutable state use
/// interior mutability.
#[async_trait::async_trait]
pub trait PluginHandle: Send + Sync {
    /// Reports the plugin's name, version and declared capabilities.
    fn identify(&self) -> PluginIdentity;

    /// Takes one sample. Callers bound this with a timeout, implementations
    /// do not need to.
    async fn read_sample(&self) -> PluginResult<Sample>;

    /// Releases the sensor. Called once, by the registry.
    async fn shutdown(&self) -> PluginResult<()>;
}
