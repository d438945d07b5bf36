//! The logger service: owns the registry, the sampler and the delivery
//! queues for the lifetime of the process.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use serde::Serialize;
use thiserror::Error;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    delivery::{dead_letter::DeadLetterStore, DeliveryError, DeliveryQueue},
    health::{HealthMonitor, HealthReport, Lifecycle, PluginStatus, ServiceState},
    plugins::{
        error::RegistryError,
        registry::PluginRegistry,
        types::init_epoch,
    },
    sampler::{Sampler, SamplerSettings},
    transport::Transport,
};
use crate::config::Config;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Startup produced no usable plugin.
    #[error("no plugin could be loaded ({failed} failed)")]
    NoPlugins { failed: usize },

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// Outcome of [`LoggerService::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Every delivery queue was emptied within the grace period.
    pub drained: bool,
    /// Readings dead-lettered because the grace period ran out.
    pub undelivered: usize,
    /// Plugins whose `shutdown` returned an error.
    pub shutdown_failures: usize,
}

pub struct LoggerService {
    registry: PluginRegistry,
    sampler: Sampler,
    delivery: DeliveryQueue,
    monitor: HealthMonitor,
    lifecycle: Lifecycle,
    grace: Duration,
    health_task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    shutdown: Option<ShutdownReport>,
}

impl LoggerService {
    /// Discovers and loads the plugins of `config.plugins.directory` and
    /// starts sampling them.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NoPlugins`] when nothing could be loaded, or the
    /// plugin directory could not be read.
    pub async fn start(config: &Config, transport: Arc<dyn Transport>) -> Result<Self, ServiceError> {
        let registry = PluginRegistry::new(config.plugins.clone());
        Self::start_with_registry(config, registry, transport).await
    }

    /// Like [`Self::start`], with a registry prepared by the caller (for
    /// example with extra builtin plugins registered).
    pub async fn start_with_registry(
        config: &Config,
        mut registry: PluginRegistry,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ServiceError> {
        init_epoch();
        let lifecycle = Lifecycle::new();
        info!(transport = transport.name(), "Starting logger service");

        let descriptors = match registry.discover(&config.plugins.directory).await {
            Ok(descriptors) => descriptors,
            Err(e) => {
                lifecycle.set_state(ServiceState::Stopped);
                return Err(e.into());
            }
        };
        let loaded = registry.load_all(descriptors).await;
        if loaded == 0 {
            let failed = registry.failures().len();
            error!(failed, "No plugin could be loaded");
            lifecycle.set_state(ServiceState::Stopped);
            return Err(ServiceError::NoPlugins { failed });
        }

        let dead_letters = Arc::new(match &config.delivery.dead_letter_path {
            Some(path) => {
                DeadLetterStore::open(config.delivery.dead_letter_capacity, path.clone()).await
            }
            None => DeadLetterStore::new(config.delivery.dead_letter_capacity),
        });
        let mut delivery = DeliveryQueue::new(&config.delivery, transport, Arc::clone(&dead_letters));
        let mut sampler = Sampler::new(SamplerSettings::from(&config.plugins));

        for instance in registry.instances() {
            let sender = delivery.register(instance.name())?;
            sampler.spawn(instance, sender);
        }
        for failure in registry.failures() {
            sampler.add_disabled(
                failure.plugin(),
                config.plugins.poll_interval_default,
                Some(failure.to_string()),
            );
        }
        for descriptor in registry.disabled() {
            sampler.add_disabled(
                descriptor.name(),
                descriptor.poll_interval(),
                Some("disabled in manifest".into()),
            );
        }

        let mut monitor = HealthMonitor::new(dead_letters, lifecycle.subscribe());
        for (name, health) in sampler.health_receivers() {
            monitor.add_plugin(health, delivery.stats_handle(&name));
        }

        let cancel = CancellationToken::new();
        let health_task = tokio::spawn(run_health_snapshots(
            monitor.clone(),
            config.service.health_interval,
            config.service.health_file.clone(),
            cancel.child_token(),
        ));

        lifecycle.set_state(ServiceState::Running);
        info!(
            loaded,
            failed = registry.failures().len(),
            disabled = registry.disabled().len(),
            "Logger service running"
        );

        Ok(Self {
            registry,
            sampler,
            delivery,
            monitor,
            lifecycle,
            grace: config.service.shutdown_grace_period,
            health_task: Some(health_task),
            cancel,
            shutdown: None,
        })
    }

    pub fn health(&self) -> HealthReport {
        self.monitor.report()
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterStore> {
        self.delivery.dead_letters()
    }

    /// Stops polling a plugin until [`Self::enable_plugin`]. Returns
    /// `false` for plugins that are not being sampled.
    pub fn disable_plugin(&self, name: &str) -> bool {
        self.sampler.disable(name)
    }

    pub fn enable_plugin(&self, name: &str) -> bool {
        self.sampler.enable(name)
    }

    /// Stops sampling, drains the delivery queues within the shutdown grace
    /// period and unloads every plugin. Calling it again returns the first
    /// report.
    pub async fn stop(&mut self) -> ShutdownReport {
        if let Some(report) = self.shutdown {
            return report;
        }

        self.lifecycle.set_state(ServiceState::Stopping);
        info!(grace = ?self.grace, "Stopping logger service");

        self.cancel.cancel();
        if let Some(task) = self.health_task.take() {
            let _ = task.await;
        }

        self.sampler.stop().await;
        let outcome = self.delivery.drain(self.grace).await;
        self.delivery.dead_letters().flush().await;
        let failures = self.registry.unload_all().await;

        let report = ShutdownReport {
            drained: outcome.drained,
            undelivered: outcome.undelivered,
            shutdown_failures: failures.len(),
        };
        self.shutdown = Some(report);
        self.lifecycle.set_state(ServiceState::Stopped);
        info!(
            drained = report.drained,
            undelivered = report.undelivered,
            dead_letters = self.dead_letters().len(),
            "Logger service stopped"
        );
        report
    }
}

impl Drop for LoggerService {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_health_snapshots(
    monitor: HealthMonitor,
    period: Duration,
    file: Option<PathBuf>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let report = monitor.report();
        info!(
            overall = ?report.overall,
            active = report.count(PluginStatus::Active),
            degraded = report.count(PluginStatus::Degraded),
            disabled = report.count(PluginStatus::Disabled),
            dead_letters = report.dead_letters,
            "Health snapshot"
        );

        if let Some(path) = &file {
            match write_health_file(path, &report).await {
                Ok(()) => debug!(path = %path.display(), "Health file written"),
                Err(e) => warn!(path = %path.display(), "Failed to write health file: {}", e),
            }
        }
    }
}

/// Writes the report next to `path` and renames it into place, so readers
/// never see a partial file.
async fn write_health_file(path: &Path, report: &HealthReport) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(report).map_err(std::io::Error::other)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tracing_test::traced_test;

    use super::*;
    use crate::core::{
        health::OverallStatus,
        plugins::{error::PluginError, mock::ScriptedPlugin},
        transport::memory::MemoryTransport,
    };

    fn config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.plugins.directory = dir.join("plugins");
        config.delivery.retry_jitter = 0.0;
        config
    }

    fn manifest(config: &Config, name: &str, builtin: &str) {
        fs::create_dir_all(&config.plugins.directory).unwrap();
        fs::write(
            config.plugins.directory.join(format!("{name}.toml")),
            format!("name = \"{name}\"\npoll_interval = \"60s\"\n\n[source]\nbuiltin = \"{builtin}\"\n"),
        )
        .unwrap();
    }

    fn registry(config: &Config, plugins: Vec<(&str, ScriptedPlugin)>) -> PluginRegistry {
        let mut registry = PluginRegistry::new(config.plugins.clone());
        for (name, plugin) in plugins {
            registry.register_builtin(name, plugin.shared());
        }
        registry
    }

    #[tokio::test(start_paused = true)]
    async fn runs_and_stops_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        manifest(&config, "bme280", "mock_bme");
        manifest(&config, "wind", "mock_wind");

        let bme = ScriptedPlugin::new("mock_bme");
        let wind = ScriptedPlugin::new("mock_wind");
        let (bme_script, wind_script) = (bme.script(), wind.script());
        let registry = registry(&config, vec![("mock_bme", bme), ("mock_wind", wind)]);
        let transport = Arc::new(MemoryTransport::new());

        let mut service =
            LoggerService::start_with_registry(&config, registry, Arc::clone(&transport) as Arc<dyn Transport>)
                .await
                .unwrap();
        assert_eq!(service.lifecycle().current_state(), ServiceState::Running);

        tokio::time::sleep(Duration::from_secs(150)).await;

        let report = service.health();
        assert_eq!(report.state, ServiceState::Running);
        assert_eq!(report.overall, OverallStatus::Healthy);
        assert_eq!(report.count(PluginStatus::Active), 2);
        let bme = report.plugin("bme280").unwrap();
        assert_eq!(bme.health.last_sequence, 3);
        assert_eq!(bme.delivery.as_ref().unwrap().delivered, 3);

        let shutdown = service.stop().await;
        assert_eq!(
            shutdown,
            ShutdownReport {
                drained: true,
                undelivered: 0,
                shutdown_failures: 0,
            }
        );
        assert_eq!(service.lifecycle().current_state(), ServiceState::Stopped);
        assert_eq!(bme_script.shutdowns(), 1);
        assert_eq!(wind_script.shutdowns(), 1);
        assert_eq!(transport.delivered_sequences("wind"), vec![1, 2, 3]);

        // A second stop is a no-op.
        assert_eq!(service.stop().await, shutdown);
        assert_eq!(bme_script.shutdowns(), 1);
    }

    #[tokio::test]
    async fn empty_plugin_directory_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        let err = LoggerService::start(&config, Arc::new(MemoryTransport::new()))
            .await
            .err()
            .unwrap();

        assert!(matches!(err, ServiceError::NoPlugins { failed: 0 }));
        assert!(config.plugins.directory.is_dir());
    }

    #[tokio::test]
    #[traced_test]
    async fn only_failed_plugins_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        manifest(&config, "bme280", "mock_bme");
        let plugin =
            ScriptedPlugin::new("mock_bme").failing_init(PluginError::ReadFailure("no i2c".into()));
        let registry = registry(&config, vec![("mock_bme", plugin)]);

        let err = LoggerService::start_with_registry(&config, registry, Arc::new(MemoryTransport::new()))
            .await
            .err()
            .unwrap();

        assert!(matches!(err, ServiceError::NoPlugins { failed: 1 }));
        assert!(logs_contain("No plugin could be loaded"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_and_disabled_plugins_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        manifest(&config, "bme280", "mock_bme");
        manifest(&config, "rain", "mock_rain");
        fs::write(
            config.plugins.directory.join("wind.toml"),
            "name = \"wind\"\nenabled = false\n\n[source]\nbuiltin = \"mock_bme\"\n",
        )
        .unwrap();
        let rain =
            ScriptedPlugin::new("mock_rain").failing_init(PluginError::ReadFailure("no gpio".into()));
        let registry = registry(
            &config,
            vec![("mock_bme", ScriptedPlugin::new("mock_bme")), ("mock_rain", rain)],
        );

        let mut service =
            LoggerService::start_with_registry(&config, registry, Arc::new(MemoryTransport::new()))
                .await
                .unwrap();
        let report = service.health();

        assert_eq!(report.overall, OverallStatus::Degraded);
        assert_eq!(report.count(PluginStatus::Disabled), 2);
        let rain = report.plugin("rain").unwrap();
        assert!(rain.delivery.is_none());
        assert!(rain.health.last_error.as_deref().unwrap().contains("no gpio"));
        assert_eq!(
            report.plugin("wind").unwrap().health.last_error.as_deref(),
            Some("disabled in manifest")
        );
        assert!(!service.enable_plugin("rain"));

        service.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn undelivered_readings_are_dead_lettered_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.service.shutdown_grace_period = Duration::from_secs(2);
        let dead_letter_file = dir.path().join("state").join("dead_letters.jsonl");
        config.delivery.dead_letter_path = Some(dead_letter_file.clone());
        manifest(&config, "bme280", "mock_bme");
        let registry = registry(&config, vec![("mock_bme", ScriptedPlugin::new("mock_bme"))]);
        let transport = Arc::new(MemoryTransport::new());
        transport.fail_plugin("bme280");

        let mut service =
            LoggerService::start_with_registry(&config, registry, Arc::clone(&transport) as Arc<dyn Transport>)
                .await
                .unwrap();
        tokio::time::sleep(Duration::from_secs(90)).await;

        let shutdown = service.stop().await;

        assert!(!shutdown.drained);
        assert_eq!(shutdown.undelivered, 2);
        assert_eq!(service.dead_letters().len(), 2);
        assert!(transport.delivered().is_empty());
        let persisted = fs::read_to_string(&dead_letter_file).unwrap();
        assert_eq!(persisted.lines().count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn operator_can_disable_and_enable_a_plugin() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        manifest(&config, "bme280", "mock_bme");
        let registry = registry(&config, vec![("mock_bme", ScriptedPlugin::new("mock_bme"))]);

        let mut service =
            LoggerService::start_with_registry(&config, registry, Arc::new(MemoryTransport::new()))
                .await
                .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(service.disable_plugin("bme280"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        let report = service.health();
        assert_eq!(report.overall, OverallStatus::Failed);
        assert_eq!(report.plugin("bme280").unwrap().health.status, PluginStatus::Disabled);

        assert!(service.enable_plugin("bme280"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        let report = service.health();
        assert_eq!(report.overall, OverallStatus::Healthy);
        assert_eq!(report.plugin("bme280").unwrap().health.last_sequence, 2);

        service.stop().await;
    }

    #[tokio::test]
    async fn health_file_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        let health_file = dir.path().join("run").join("health.json");
        config.service.health_interval = Duration::from_millis(20);
        config.service.health_file = Some(health_file.clone());
        manifest(&config, "bme280", "mock_bme");
        let registry = registry(&config, vec![("mock_bme", ScriptedPlugin::new("mock_bme"))]);

        let mut service =
            LoggerService::start_with_registry(&config, registry, Arc::new(MemoryTransport::new()))
                .await
                .unwrap();

        let mut written = None;
        for _ in 0..250 {
            if let Ok(raw) = fs::read_to_string(&health_file) {
                written = Some(raw);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        service.stop().await;

        let json: serde_json::Value = serde_json::from_str(&written.unwrap()).unwrap();
        assert_eq!(json["plugins"][0]["name"], "bme280");
        assert_eq!(json["state"], "running");
    }
}
