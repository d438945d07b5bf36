//! Per-plugin delivery queues with retry and dead-lettering.
//!
//! Each registered plugin gets a bounded channel and one worker task. The
//! sampler task of that plugin is the only producer and the worker the only
//! consumer, so readings leave in the order they were produced. The worker
//! keeps retrying the head of its queue with exponential backoff until it
//! is delivered or its attempts are exhausted, in which case it goes to the
//! shared [`DeadLetterStore`] and the worker moves on to the next reading.

use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use self::{
    backoff::RetryPolicy,
    dead_letter::{DeadLetter, DeadLetterReason, DeadLetterStore},
};
use super::{
    plugins::types::Reading,
    transport::{Transport, TransportError},
};
use crate::config::delivery::DeliveryConfig;

pub mod backoff;
pub mod dead_letter;

/// Errors of the delivery queue itself. Transport failures never surface
/// here; they are retried and dead-lettered.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeliveryError {
    #[error("plugin '{0}' already has a delivery queue")]
    AlreadyRegistered(String),

    /// The reading was moved to the dead-letter store because the queue was
    /// full.
    #[error("delivery queue of '{0}' is full")]
    QueueFull(String),

    /// The worker has stopped; the reading was dead-lettered.
    #[error("delivery queue of '{0}' is closed")]
    Closed(String),
}

/// A reading being delivered.
#[derive(Debug, Clone)]
struct DeliveryTask {
    reading: Reading,
    attempts: u32,
    next_retry_at: Instant,
    last_error: Option<TransportError>,
}

impl DeliveryTask {
    fn new(reading: Reading) -> Self {
        Self {
            reading,
            attempts: 0,
            next_retry_at: Instant::now(),
            last_error: None,
        }
    }

    fn into_dead_letter(self, reason: DeadLetterReason) -> DeadLetter {
        DeadLetter::new(
            self.reading,
            reason,
            self.attempts,
            self.last_error.map(|e| e.to_string()),
        )
    }
}

/// Point-in-time delivery statistics of one plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    pub delivered: u64,
    pub retries: u64,
    pub dead_lettered: u64,
    /// Readings accepted but not yet delivered or dead-lettered, including
    /// the one in flight.
    pub queue_depth: usize,
    pub last_error: Option<String>,
}

/// Counters shared between a worker, its sender and the health report.
#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    retries: AtomicU64,
    dead_lettered: AtomicU64,
    pending: AtomicUsize,
    abandoned: AtomicUsize,
    last_error: Mutex<Option<String>>,
}

impl Counters {
    fn set_last_error(&self, error: &TransportError) {
        let mut last = self.last_error.lock().unwrap_or_else(|p| p.into_inner());
        *last = Some(error.to_string());
    }

    fn finish(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Read-only view of one plugin's delivery counters.
#[derive(Debug, Clone)]
pub struct DeliveryStatsHandle {
    counters: Arc<Counters>,
}

impl DeliveryStatsHandle {
    pub fn snapshot(&self) -> DeliveryStats {
        let c = &self.counters;
        DeliveryStats {
            delivered: c.delivered.load(Ordering::SeqCst),
            retries: c.retries.load(Ordering::SeqCst),
            dead_lettered: c.dead_lettered.load(Ordering::SeqCst),
            queue_depth: c.pending.load(Ordering::SeqCst),
            last_error: c
                .last_error
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .clone(),
        }
    }
}

/// Producer side of one plugin's queue, owned by its sampler task.
#[derive(Debug, Clone)]
pub struct ReadingSender {
    plugin: String,
    tx: mpsc::Sender<Reading>,
    counters: Arc<Counters>,
    dead_letters: Arc<DeadLetterStore>,
}

impl ReadingSender {
    /// Appends a reading to the queue without waiting.
    ///
    /// # Errors
    ///
    /// When the queue is full or closed the reading is moved to the
    /// dead-letter store and [`DeliveryError::QueueFull`] or
    /// [`DeliveryError::Closed`] is returned.
    pub fn enqueue(&self, reading: Reading) -> Result<(), DeliveryError> {
        self.counters.pending.fetch_add(1, Ordering::SeqCst);
        match self.tx.try_send(reading) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(reading)) => {
                self.counters.finish();
                self.counters.dead_lettered.fetch_add(1, Ordering::SeqCst);
                self.dead_letters.push(DeadLetter::new(
                    reading,
                    DeadLetterReason::QueueFull,
                    0,
                    Some("queue full".into()),
                ));
                Err(DeliveryError::QueueFull(self.plugin.clone()))
            }
            Err(mpsc::error::TrySendError::Closed(reading)) => {
                self.counters.finish();
                self.counters.dead_lettered.fetch_add(1, Ordering::SeqCst);
                self.dead_letters.push(DeadLetter::new(
                    reading,
                    DeadLetterReason::Shutdown,
                    0,
                    Some("delivery worker stopped".into()),
                ));
                Err(DeliveryError::Closed(self.plugin.clone()))
            }
        }
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }
}

/// Result of [`DeliveryQueue::drain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DrainOutcome {
    /// Every queue was emptied before the grace period ran out.
    pub drained: bool,
    /// Readings dead-lettered because the grace period ran out.
    pub undelivered: usize,
}

struct Worker {
    plugin: String,
    counters: Arc<Counters>,
    handle: Option<JoinHandle<()>>,
}

/// Everything a worker needs besides its channel.
struct WorkerContext {
    plugin: String,
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    send_timeout: Duration,
    counters: Arc<Counters>,
    dead_letters: Arc<DeadLetterStore>,
    cancel: CancellationToken,
}

pub struct DeliveryQueue {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    send_timeout: Duration,
    capacity: usize,
    dead_letters: Arc<DeadLetterStore>,
    workers: Vec<Worker>,
    cancel: CancellationToken,
}

impl DeliveryQueue {
    pub fn new(
        config: &DeliveryConfig,
        transport: Arc<dyn Transport>,
        dead_letters: Arc<DeadLetterStore>,
    ) -> Self {
        Self {
            transport,
            policy: RetryPolicy::from_config(config),
            send_timeout: config.send_timeout,
            capacity: config.queue_capacity.max(1),
            dead_letters,
            workers: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Creates the queue and worker for `plugin` and returns its producer
    /// handle. The worker exits once every [`ReadingSender`] clone is
    /// dropped and the queue is empty.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::AlreadyRegistered`] if `plugin` already has a queue.
    pub fn register(&mut self, plugin: &str) -> Result<ReadingSender, DeliveryError> {
        if self.workers.iter().any(|w| w.plugin == plugin) {
            return Err(DeliveryError::AlreadyRegistered(plugin.to_string()));
        }

        let (tx, rx) = mpsc::channel(self.capacity);
        let counters = Arc::new(Counters::default());
        let context = WorkerContext {
            plugin: plugin.to_string(),
            transport: Arc::clone(&self.transport),
            policy: self.policy.clone(),
            send_timeout: self.send_timeout,
            counters: Arc::clone(&counters),
            dead_letters: Arc::clone(&self.dead_letters),
            cancel: self.cancel.child_token(),
        };
        let handle = tokio::spawn(run_worker(context, rx).in_current_span());

        debug!(plugin = %plugin, capacity = self.capacity, "Delivery worker started");
        self.workers.push(Worker {
            plugin: plugin.to_string(),
            counters: Arc::clone(&counters),
            handle: Some(handle),
        });

        Ok(ReadingSender {
            plugin: plugin.to_string(),
            tx,
            counters,
            dead_letters: Arc::clone(&self.dead_letters),
        })
    }

    pub fn stats(&self, plugin: &str) -> Option<DeliveryStats> {
        self.stats_handle(plugin).map(|h| h.snapshot())
    }

    pub fn stats_handle(&self, plugin: &str) -> Option<DeliveryStatsHandle> {
        self.workers
            .iter()
            .find(|w| w.plugin == plugin)
            .map(|w| DeliveryStatsHandle {
                counters: Arc::clone(&w.counters),
            })
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterStore> {
        &self.dead_letters
    }

    /// Waits for the workers to empty their queues, for at most `grace`.
    /// Producers must have been dropped beforehand, otherwise the queues
    /// never close. Workers still busy when the grace period ends are
    /// cancelled and their remaining readings dead-lettered.
    pub async fn drain(&mut self, grace: Duration) -> DrainOutcome {
        let mut handles: Vec<JoinHandle<()>> =
            self.workers.iter_mut().filter_map(|w| w.handle.take()).collect();

        let drained = tokio::time::timeout(grace, async {
            for handle in handles.iter_mut() {
                let _ = handle.await;
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!(grace = ?grace, "Delivery queues not drained in time, cancelling workers");
            self.cancel.cancel();
            for handle in handles {
                let _ = handle.await;
            }
        }

        let undelivered = self
            .workers
            .iter()
            .map(|w| w.counters.abandoned.load(Ordering::SeqCst))
            .sum();
        info!(drained, undelivered, "Delivery queues stopped");
        DrainOutcome {
            drained,
            undelivered,
        }
    }
}

impl Drop for DeliveryQueue {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// How a task left the worker.
enum Attempt {
    Delivered,
    DeadLettered,
    Cancelled,
}

async fn run_worker(context: WorkerContext, mut rx: mpsc::Receiver<Reading>) {
    loop {
        let reading = tokio::select! {
            biased;
            _ = context.cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(reading) => reading,
                None => break,
            },
        };

        let outcome = deliver(&context, DeliveryTask::new(reading)).await;
        context.counters.finish();
        if matches!(outcome, Attempt::Cancelled) {
            break;
        }
    }

    if context.cancel.is_cancelled() {
        rx.close();
        while let Ok(reading) = rx.try_recv() {
            abandon(&context, DeliveryTask::new(reading));
            context.counters.finish();
        }
    }
    debug!(plugin = %context.plugin, "Delivery worker stopped");
}

/// Delivers one task, retrying until success, exhaustion or cancellation.
async fn deliver(context: &WorkerContext, mut task: DeliveryTask) -> Attempt {
    let plugin = &context.plugin;
    loop {
        let send = async {
            sleep_until(task.next_retry_at).await;
            tokio::time::timeout(context.send_timeout, context.transport.send(&task.reading)).await
        };
        let result = tokio::select! {
            biased;
            _ = context.cancel.cancelled() => None,
            result = send => Some(result),
        };

        let error = match result {
            None => {
                abandon(context, task);
                return Attempt::Cancelled;
            }
            Some(Ok(Ok(()))) => {
                context.counters.delivered.fetch_add(1, Ordering::SeqCst);
                debug!(
                    plugin = %plugin,
                    sequence = task.reading.sequence,
                    attempt = task.attempts + 1,
                    "Reading delivered"
                );
                return Attempt::Delivered;
            }
            Some(Ok(Err(error))) => error,
            Some(Err(_)) => TransportError::Unreachable(format!(
                "send timed out after {:?}",
                context.send_timeout
            )),
        };

        task.attempts += 1;
        context.counters.set_last_error(&error);

        if context.policy.exhausted(task.attempts) {
            task.last_error = Some(error);
            context.counters.dead_lettered.fetch_add(1, Ordering::SeqCst);
            context
                .dead_letters
                .push(task.into_dead_letter(DeadLetterReason::Exhausted));
            return Attempt::DeadLettered;
        }

        let delay = context.policy.delay(task.attempts);
        task.next_retry_at = Instant::now() + delay;
        context.counters.retries.fetch_add(1, Ordering::SeqCst);
        warn!(
            plugin = %plugin,
            sequence = task.reading.sequence,
            attempt = task.attempts,
            retry_in = ?delay,
            "Delivery failed: {}",
            error
        );
        task.last_error = Some(error);
    }
}

fn abandon(context: &WorkerContext, task: DeliveryTask) {
    context.counters.abandoned.fetch_add(1, Ordering::SeqCst);
    context.counters.dead_lettered.fetch_add(1, Ordering::SeqCst);
    context
        .dead_letters
        .push(task.into_dead_letter(DeadLetterReason::Shutdown));
}
