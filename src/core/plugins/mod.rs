//! Sensor plugins: the interface, the data they produce and the registry
//! that loads them.

/// External executables speaking JSON lines over stdio.
pub mod command;

/// Manifest parsing into plugin descriptors.
pub mod descriptor;

/// Plugin, load and registry error types.
pub mod error;

/// Discovery, loading, validation and ownership of plugin instances.
pub mod registry;

/// The `SensorPlugin` / `PluginHandle` capability traits.
pub mod traits;

/// Samples, readings, measurement values and plugin identity.
pub mod types;

/// CPU thermal zones from `/sys/class/thermal`.
#[cfg(all(feature = "plugin-thermal", target_os = "linux"))]
pub mod thermal;

/// Temperature, humidity and pressure from an Industrial I/O device.
#[cfg(all(feature = "plugin-iio", target_os = "linux"))]
pub mod iio;

#[cfg(test)]
pub(crate) mod mock;

pub use descriptor::{PluginDescriptor, PluginSource};
pub use error::{LoadError, PluginError, RegistryError};
pub use registry::{PluginInstance, PluginRegistry};
pub use traits::{PluginHandle, SensorPlugin};
pub use types::{MeasurementValue, Measurements, PluginIdentity, Reading, Sample};
