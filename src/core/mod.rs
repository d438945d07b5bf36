//! Runtime of the logger: plugins, sampling, delivery and health.

/// Per-plugin delivery queues, retry policy and the dead-letter store.
pub mod delivery;

/// Plugin health, service lifecycle and health reports.
pub mod health;

/// The plugin interface and the registry.
pub mod plugins;

/// One polling task per plugin with failure tracking and backoff.
pub mod sampler;

/// The service tying everything together.
pub mod service;

/// Destinations for finished readings.
pub mod transport;
