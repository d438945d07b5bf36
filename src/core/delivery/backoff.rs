//! Retry delays for failed deliveries.
//!
//! The nominal delay doubles with every failed attempt:
//!
//! ```text
//! delay[n] = min(base * 2^(n-1), max)
//! ```
//!
//! and is then spread by a uniform random jitter of ±`jitter` so that
//! workers retrying against the same recovering data station do not fire
//! in lockstep. The jittered delay never exceeds `max`.

use std::time::Duration;

use rand::Rng;

use crate::config::delivery::DeliveryConfig;

/// Exponent above which the doubling has long since passed any sane cap.
const MAX_EXPONENT: u32 = 62;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, jitter: f64, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter: jitter.clamp(0.0, 1.0),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self::new(
            config.retry_base_delay,
            config.retry_max_delay,
            config.retry_jitter,
            config.max_delivery_attempts,
        )
    }

    /// Delay before the next try after `attempts` failed attempts, without
    /// jitter.
    pub fn nominal_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(MAX_EXPONENT);
        let secs = self.base_delay.as_secs_f64() * 2f64.powi(exponent as i32);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Jittered delay before the next try after `attempts` failed attempts.
    pub fn delay(&self, attempts: u32) -> Duration {
        let nominal = self.nominal_delay(attempts);
        if self.jitter == 0.0 {
            return nominal;
        }

        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        let secs = (nominal.as_secs_f64() * (1.0 + spread)).max(0.0);
        Duration::from_secs_f64(secs).min(self.max_delay)
    }

    /// Whether a task with `attempts` failed attempts goes to the
    /// dead-letter store instead of being retried.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DeliveryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: f64) -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60), jitter, 10)
    }

    #[test]
    fn first_retry_waits_the_base_delay() {
        assert_eq!(policy(0.0).delay(1), Duration::from_secs(1));
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let p = policy(0.0);
        assert_eq!(p.delay(2), Duration::from_secs(2));
        assert_eq!(p.delay(3), Duration::from_secs(4));
        assert_eq!(p.delay(6), Duration::from_secs(32));
    }

    #[test]
    fn delay_is_capped() {
        let p = policy(0.0);
        assert_eq!(p.delay(7), Duration::from_secs(60));
        assert_eq!(p.delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let p = policy(0.2);
        for _ in 0..200 {
            let d = p.delay(3);
            assert!(d >= Duration::from_secs_f64(3.2) && d <= Duration::from_secs_f64(4.8));
        }
        for _ in 0..200 {
            assert!(p.delay(20) <= Duration::from_secs(60));
        }
    }

    #[test]
    fn exhaustion_follows_max_attempts() {
        let p = policy(0.0);
        assert!(!p.exhausted(9));
        assert!(p.exhausted(10));
    }

    #[test]
    fn max_below_base_is_raised_to_base() {
        let p = RetryPolicy::new(Duration::from_secs(10), Duration::from_secs(1), 0.0, 3);
        assert_eq!(p.delay(1), Duration::from_secs(10));
        assert_eq!(p.max_delay(), Duration::from_secs(10));
    }
}
