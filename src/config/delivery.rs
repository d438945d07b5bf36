//! Configuration for the delivery queue and the dead-letter store.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use validator::Validate;

use super::plugins::validate_non_zero;

/// Retry, queueing and dead-letter settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Failed sends after which a reading is moved to the dead-letter store.
    #[validate(range(min = 1, message = "At least one delivery attempt is required"))]
    pub max_delivery_attempts: u32,

    /// Delay before the first retry; doubles with every further attempt.
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_non_zero"))]
    pub retry_base_delay: Duration,

    /// Upper bound for a single retry delay.
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_non_zero"))]
    pub retry_max_delay: Duration,

    /// Relative jitter applied to every retry delay (0.2 means ±20%).
    #[validate(range(min = 0.0, max = 1.0, message = "Jitter must be within 0.0..=1.0"))]
    pub retry_jitter: f64,

    /// Upper bound for one transport send; expiry counts as unreachable.
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_non_zero"))]
    pub send_timeout: Duration,

    /// Readings buffered per plugin before new readings overflow to the
    /// dead-letter store.
    #[validate(range(min = 1, message = "Queue capacity must be at least 1"))]
    pub queue_capacity: usize,

    /// Records kept in memory by the dead-letter store.
    #[validate(range(min = 1, message = "Dead-letter capacity must be at least 1"))]
    pub dead_letter_capacity: usize,

    /// Optional JSON-lines file every dead letter is appended to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letter_path: Option<PathBuf>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_delivery_attempts: 10,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(5 * 60),
            retry_jitter: 0.2,
            send_timeout: Duration::from_secs(10),
            queue_capacity: 1024,
            dead_letter_capacity: 256,
            dead_letter_path: None,
        }
    }
}
