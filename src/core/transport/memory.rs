//! In-memory transport with scripted failures, for tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use super::{Transport, TransportError};
use crate::core::plugins::types::Reading;

#[derive(Default)]
pub(crate) struct MemoryTransport {
    delivered: Mutex<Vec<(String, u64)>>,
    /// Remaining failures per `(plugin, sequence)`.
    failures: Mutex<HashMap<(String, u64), u32>>,
    failing_plugins: Mutex<HashSet<String>>,
    rejecting: bool,
    delay: Duration,
    sends: AtomicUsize,
}

impl MemoryTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Every send sleeps this long first.
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Failures are reported as `Rejected` instead of `Unreachable`.
    pub(crate) fn rejecting(mut self) -> Self {
        self.rejecting = true;
        self
    }

    /// The next `times` sends of this reading fail.
    pub(crate) fn fail_reading(&self, plugin: &str, sequence: u64, times: u32) {
        self.failures
            .lock()
            .unwrap()
            .insert((plugin.to_string(), sequence), times);
    }

    /// Every send for this plugin fails until [`Self::heal_plugin`].
    pub(crate) fn fail_plugin(&self, plugin: &str) {
        self.failing_plugins.lock().unwrap().insert(plugin.to_string());
    }

    pub(crate) fn heal_plugin(&self, plugin: &str) {
        self.failing_plugins.lock().unwrap().remove(plugin);
    }

    pub(crate) fn delivered(&self) -> Vec<(String, u64)> {
        self.delivered.lock().unwrap().clone()
    }

    pub(crate) fn delivered_sequences(&self, plugin: &str) -> Vec<u64> {
        self.delivered()
            .into_iter()
            .filter(|(p, _)| p == plugin)
            .map(|(_, s)| s)
            .collect()
    }

    pub(crate) fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    fn failure(&self, message: String) -> TransportError {
        if self.rejecting {
            TransportError::Rejected(message)
        } else {
            TransportError::Unreachable(message)
        }
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn send(&self, reading: &Reading) -> Result<(), TransportError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.failing_plugins.lock().unwrap().contains(&reading.plugin) {
            return Err(self.failure(format!("{} is down", reading.plugin)));
        }

        let key = (reading.plugin.clone(), reading.sequence);
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(self.failure(format!("scripted failure for seq {}", reading.sequence)));
                }
            }
        }

        self.delivered.lock().unwrap().push(key);
        Ok(())
    }
}
