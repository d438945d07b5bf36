//! Periodic sampling of loaded plugins.
//!
//! The `Sampler` spawns one task per plugin instance. Each task polls its
//! plugin on its own schedule, turns successful samples into sequenced
//! readings for the plugin's delivery queue and tracks failures. A slow or
//! failing plugin only ever delays itself.
//!
//! After `max_consecutive_failures` failures in a row a plugin becomes
//! `Degraded` and its interval grows by `backoff_factor` per failure, up to
//! `backoff_cap`. The first successful read restores `Active` and the base
//! interval.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::{
    delivery::{DeliveryError, ReadingSender},
    health::{PluginHealth, PluginStatus},
    plugins::{
        error::PluginError,
        registry::PluginInstance,
        types::{Reading, Sample},
    },
};
use crate::config::plugins::PluginsConfig;

/// Degradation parameters shared by every sampler task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerSettings {
    pub max_consecutive_failures: u32,
    pub backoff_factor: f64,
    pub backoff_cap: Duration,
}

impl From<&PluginsConfig> for SamplerSettings {
    fn from(config: &PluginsConfig) -> Self {
        Self {
            max_consecutive_failures: config.max_consecutive_failures.max(1),
            backoff_factor: config.backoff_factor.max(1.0),
            backoff_cap: config.backoff_cap,
        }
    }
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self::from(&PluginsConfig::default())
    }
}

/// Poll interval after `failures` consecutive failures.
///
/// Below the threshold the base interval is used. From the threshold on it
/// is `base * factor^failures`, never below `base` and never above the cap
/// (a cap below `base` leaves the interval at `base`).
pub fn next_interval(base: Duration, failures: u32, settings: &SamplerSettings) -> Duration {
    if failures < settings.max_consecutive_failures {
        return base;
    }

    let cap = settings.backoff_cap.max(base);
    let exponent = i32::try_from(failures).unwrap_or(i32::MAX);
    let secs = base.as_secs_f64() * settings.backoff_factor.powi(exponent);
    if !secs.is_finite() || secs >= cap.as_secs_f64() {
        cap
    } else {
        Duration::from_secs_f64(secs).max(base)
    }
}

struct SamplerTask {
    name: String,
    health: watch::Receiver<PluginHealth>,
    /// `true` while the plugin may be polled.
    enabled: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

pub struct Sampler {
    settings: SamplerSettings,
    tasks: Vec<SamplerTask>,
    cancel: CancellationToken,
}

impl Sampler {
    pub fn new(settings: SamplerSettings) -> Self {
        Self {
            settings,
            tasks: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Starts polling `instance`, handing readings to `sender`. The first
    /// sample is taken right away.
    pub fn spawn(&mut self, instance: &Arc<PluginInstance>, sender: ReadingSender) {
        let name = instance.name().to_string();
        let base = instance.descriptor().poll_interval();
        let (health_tx, health_rx) =
            watch::channel(PluginHealth::new(&name, PluginStatus::Active, base));
        let (enabled_tx, enabled_rx) = watch::channel(true);

        let task = PluginTask {
            plugin: Arc::downgrade(instance),
            name: name.clone(),
            base,
            read_timeout: instance.descriptor().read_timeout(),
            settings: self.settings,
            sender,
            health: health_tx,
            enabled: enabled_rx,
            cancel: self.cancel.child_token(),
            sequence: 0,
            failures: 0,
        };
        let handle = tokio::spawn(task.run().in_current_span());

        debug!(plugin = %name, interval = ?base, "Sampler task started");
        self.tasks.push(SamplerTask {
            name,
            health: health_rx,
            enabled: Some(enabled_tx),
            handle: Some(handle),
        });
    }

    /// Reports a plugin that is not polled at all, e.g. because it failed
    /// to load.
    pub fn add_disabled(&mut self, name: &str, interval: Duration, reason: Option<String>) {
        let mut health = PluginHealth::new(name, PluginStatus::Disabled, interval);
        health.last_error = reason;
        let (_, health_rx) = watch::channel(health);
        self.tasks.push(SamplerTask {
            name: name.to_string(),
            health: health_rx,
            enabled: None,
            handle: None,
        });
    }

    pub fn health(&self) -> Vec<PluginHealth> {
        self.tasks.iter().map(|t| t.health.borrow().clone()).collect()
    }

    pub fn subscribe(&self, name: &str) -> Option<watch::Receiver<PluginHealth>> {
        self.task(name).map(|t| t.health.clone())
    }

    /// Receivers of every plugin's health, in registration order.
    pub fn health_receivers(&self) -> Vec<(String, watch::Receiver<PluginHealth>)> {
        self.tasks
            .iter()
            .map(|t| (t.name.clone(), t.health.clone()))
            .collect()
    }

    /// Parks a plugin's task. Returns `false` if no running task has this
    /// name.
    pub fn disable(&self, name: &str) -> bool {
        self.set_enabled(name, false)
    }

    /// Resumes a parked task with a fresh failure count and base interval.
    /// Returns `false` if no running task has this name.
    pub fn enable(&self, name: &str) -> bool {
        self.set_enabled(name, true)
    }

    fn set_enabled(&self, name: &str, value: bool) -> bool {
        let Some(enabled) = self.task(name).and_then(|t| t.enabled.as_ref()) else {
            return false;
        };
        if enabled.is_closed() {
            return false;
        }
        enabled.send_if_modified(|current| {
            let changed = *current != value;
            *current = value;
            changed
        });
        true
    }

    fn task(&self, name: &str) -> Option<&SamplerTask> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Cancels every task and waits for them. Reads in flight are
    /// abandoned. Each task drops its [`ReadingSender`] on exit.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.iter_mut() {
            if let Some(handle) = task.handle.take() {
                if let Err(e) = handle.await {
                    warn!(plugin = %task.name, "Sampler task ended abnormally: {}", e);
                }
            }
        }
        info!(tasks = self.tasks.len(), "Sampler stopped");
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// State owned by one plugin's polling task.
struct PluginTask {
    plugin: Weak<PluginInstance>,
    name: String,
    base: Duration,
    read_timeout: Duration,
    settings: SamplerSettings,
    sender: ReadingSender,
    health: watch::Sender<PluginHealth>,
    enabled: watch::Receiver<bool>,
    cancel: CancellationToken,
    sequence: u64,
    failures: u32,
}

impl PluginTask {
    async fn run(mut self) {
        loop {
            let enabled = *self.enabled.borrow_and_update();
            if !enabled && !self.park().await {
                return;
            }

            let Some(instance) = self.plugin.upgrade() else {
                self.health.send_modify(|h| {
                    h.status = PluginStatus::Disabled;
                    h.last_error = Some("plugin was unloaded".into());
                });
                info!(plugin = %self.name, "Plugin unloaded, sampler task exiting");
                return;
            };

            let read = tokio::time::timeout(self.read_timeout, instance.handle().read_sample());
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                outcome = read => outcome,
            };
            drop(instance);

            let result = match outcome {
                Ok(result) => result.and_then(|sample| sample.validate().map(|()| sample)),
                Err(_) => Err(PluginError::Timeout(self.read_timeout)),
            };

            let interval = match result {
                Ok(sample) => self.on_sample(sample),
                Err(error) => self.on_failure(error),
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                changed = self.enabled.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Waits until re-enabled. Returns `false` when the task should exit.
    async fn park(&mut self) -> bool {
        self.health.send_modify(|h| h.status = PluginStatus::Disabled);
        info!(plugin = %self.name, "Plugin disabled");

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return false,
            enabled = self.enabled.wait_for(|enabled| *enabled) => {
                if enabled.is_err() {
                    return false;
                }
            }
        }

        self.failures = 0;
        let base = self.base;
        self.health.send_modify(|h| {
            h.status = PluginStatus::Active;
            h.consecutive_failures = 0;
            h.interval = base;
        });
        info!(plugin = %self.name, "Plugin re-enabled");
        true
    }

    fn on_sample(&mut self, sample: Sample) -> Duration {
        self.sequence += 1;
        let reading = Reading::from_sample(&self.name, self.sequence, sample);
        let recovered = self.failures >= self.settings.max_consecutive_failures;
        self.failures = 0;

        let sequence = self.sequence;
        let base = self.base;
        self.health.send_modify(|h| {
            h.status = PluginStatus::Active;
            h.interval = base;
            h.consecutive_failures = 0;
            h.total_samples += 1;
            h.last_sequence = sequence;
            h.last_success = Some(reading.captured_at);
        });

        if recovered {
            info!(plugin = %self.name, interval = ?base, "Plugin recovered");
        }
        debug!(plugin = %self.name, sequence, "Sample taken");

        match self.sender.enqueue(reading) {
            Ok(()) => {}
            Err(e @ DeliveryError::QueueFull(_)) => {
                warn!(plugin = %self.name, sequence, "Reading not queued: {}", e)
            }
            Err(e) => debug!(plugin = %self.name, sequence, "Reading not queued: {}", e),
        }
        base
    }

    fn on_failure(&mut self, error: PluginError) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let failures = self.failures;
        let interval = next_interval(self.base, failures, &self.settings);
        let degraded = failures >= self.settings.max_consecutive_failures;
        let message = error.to_string();

        self.health.send_modify(|h| {
            h.status = if degraded {
                PluginStatus::Degraded
            } else {
                PluginStatus::Active
            };
            h.interval = interval;
            h.consecutive_failures = failures;
            h.total_failures += 1;
            h.last_error = Some(message);
        });

        if failures == self.settings.max_consecutive_failures {
            warn!(
                plugin = %self.name,
                failures,
                interval = ?interval,
                "Plugin degraded: {}",
                error
            );
        } else {
            warn!(plugin = %self.name, failures, "Sample failed: {}", error);
        }
        interval
    }
}
