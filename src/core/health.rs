//! Service lifecycle and health reporting.
//!
//! Every sampler task publishes its [`PluginHealth`] on a `watch` channel,
//! the service publishes its [`ServiceState`] through a [`Lifecycle`]. A
//! [`HealthMonitor`] holds receivers for all of them plus the delivery
//! counters and the dead-letter store, and can produce a [`HealthReport`]
//! at any time without locking the hot path.

use std::{fmt, sync::Arc, time::Duration};

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::debug;

use super::delivery::{dead_letter::DeadLetterStore, DeliveryStats, DeliveryStatsHandle};

/// Sampling state of one plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Active,
    /// Repeated read failures; polled at a backed-off interval.
    Degraded,
    /// Not polled, by operator action or because it failed to load.
    Disabled,
}

impl PluginStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginStatus::Active => "active",
            PluginStatus::Degraded => "degraded",
            PluginStatus::Disabled => "disabled",
        }
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginHealth {
    pub name: String,
    pub status: PluginStatus,
    /// Current poll interval, including backoff.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_samples: u64,
    /// Sequence number of the last reading produced, 0 before the first.
    pub last_sequence: u64,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_success: Option<OffsetDateTime>,
}

impl PluginHealth {
    pub fn new(name: impl Into<String>, status: PluginStatus, interval: Duration) -> Self {
        Self {
            name: name.into(),
            status,
            interval,
            consecutive_failures: 0,
            total_failures: 0,
            total_samples: 0,
            last_sequence: 0,
            last_error: None,
            last_success: None,
        }
    }
}

/// Lifecycle of the logger service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Starting => "Starting",
            ServiceState::Running => "Running",
            ServiceState::Stopping => "Stopping",
            ServiceState::Stopped => "Stopped",
        };
        f.write_str(s)
    }
}

/// Shared service state that any number of observers can subscribe to.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state_tx: Arc<watch::Sender<ServiceState>>,
    state_rx: watch::Receiver<ServiceState>,
}

impl Lifecycle {
    /// Creates a tracker in the `Starting` state.
    pub fn new() -> Self {
        let (state_tx, state_rx) = watch::channel(ServiceState::Starting);
        Self {
            state_tx: Arc::new(state_tx),
            state_rx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ServiceState> {
        self.state_rx.clone()
    }

    pub fn current_state(&self) -> ServiceState {
        *self.state_rx.borrow()
    }

    /// Updates the state and logs the transition at debug level.
    pub fn set_state(&self, state: ServiceState) {
        let old_state = self.current_state();
        self.state_tx.send_replace(state);
        debug!("Service state changed: {} -> {}", old_state, state);
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregate over all plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    /// Every plugin is active.
    Healthy,
    /// At least one plugin is degraded or disabled, at least one active.
    Degraded,
    /// No plugin is active.
    Failed,
}

impl OverallStatus {
    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = PluginStatus>,
    {
        let (mut active, mut other) = (0usize, 0usize);
        for status in statuses {
            if status == PluginStatus::Active {
                active += 1;
            } else {
                other += 1;
            }
        }
        match (active, other) {
            (0, _) => OverallStatus::Failed,
            (_, 0) => OverallStatus::Healthy,
            _ => OverallStatus::Degraded,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginReport {
    #[serde(flatten)]
    pub health: PluginHealth,
    /// Absent for plugins that never got a delivery queue.
    pub delivery: Option<DeliveryStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub state: ServiceState,
    pub overall: OverallStatus,
    pub plugins: Vec<PluginReport>,
    pub dead_letters: usize,
    pub dead_letters_evicted: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
}

impl HealthReport {
    pub fn plugin(&self, name: &str) -> Option<&PluginReport> {
        self.plugins.iter().find(|p| p.health.name == name)
    }

    pub fn count(&self, status: PluginStatus) -> usize {
        self.plugins
            .iter()
            .filter(|p| p.health.status == status)
            .count()
    }
}

#[derive(Debug, Clone)]
struct PluginSource {
    health: watch::Receiver<PluginHealth>,
    delivery: Option<DeliveryStatsHandle>,
}

/// Assembles [`HealthReport`]s from live sources. Cheap to clone.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    plugins: Vec<PluginSource>,
    dead_letters: Arc<DeadLetterStore>,
    lifecycle: watch::Receiver<ServiceState>,
}

impl HealthMonitor {
    pub fn new(dead_letters: Arc<DeadLetterStore>, lifecycle: watch::Receiver<ServiceState>) -> Self {
        Self {
            plugins: Vec::new(),
            dead_letters,
            lifecycle,
        }
    }

    pub fn add_plugin(
        &mut self,
        health: watch::Receiver<PluginHealth>,
        delivery: Option<DeliveryStatsHandle>,
    ) {
        self.plugins.push(PluginSource { health, delivery });
    }

    pub fn report(&self) -> HealthReport {
        let plugins: Vec<PluginReport> = self
            .plugins
            .iter()
            .map(|source| PluginReport {
                health: source.health.borrow().clone(),
                delivery: source.delivery.as_ref().map(DeliveryStatsHandle::snapshot),
            })
            .collect();

        HealthReport {
            state: *self.lifecycle.borrow(),
            overall: OverallStatus::from_statuses(plugins.iter().map(|p| p.health.status)),
            plugins,
            dead_letters: self.dead_letters.len(),
            dead_letters_evicted: self.dead_letters.evicted(),
            generated_at: OffsetDateTime::now_utc(),
        }
    }
}
