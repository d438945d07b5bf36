//! ccs-datalogger - plugin-driven weather sensor logging agent
//!
//! The agent loads sensor plugins from a directory of TOML manifests, polls
//! each of them on its own schedule and hands the resulting readings to a
//! transport. Delivery is retried with exponential backoff; readings that
//! cannot be delivered end up in a bounded dead-letter store instead of
//! being lost. It is designed to run unattended on small boards for months.
//!
//! ## Modules
//!
//! * `config` - TOML configuration with defaults, validated with the
//!   `validator` crate. A missing file is created from the defaults.
//!
//! * `core` - Runtime components:
//!   - Plugin interface, builtin plugins and the plugin registry
//!   - Sampler (per-plugin polling, degradation and backoff)
//!   - Delivery queue with retry and dead-lettering
//!   - Transports (CSV files, stdout)
//!   - Health reporting and the logger service
//!
//! * `logger` - Centralized logging initialization using `tracing`.
//!   Supports console output in multiple formats (compact, pretty, JSON)
//!   and optional systemd journald integration.
//!
//! ## Features
//!
//! * `plugin-thermal` - builtin `cpu_thermal` plugin reading
//!   `/sys/class/thermal` (default: enabled, Linux only).
//! * `plugin-iio` - builtin `iio_environment` plugin for Industrial I/O
//!   temperature, humidity and pressure sensors such as the BME280
//!   (default: enabled, Linux only).

pub mod config;
pub mod core;
pub mod logger;
