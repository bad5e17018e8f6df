//! Retry backoff for failed tasks.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use super::model::deadline_after;

/// Exponential backoff with optional jitter.
///
/// The delay before attempt `n + 1` (after the n-th failure) is
/// `base_delay * 2^(n-1)`, capped at `max_delay`, then shortened by a random
/// fraction of at most `jitter`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// In `[0.0, 1.0]`.
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, jitter: f64) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Requeued tasks are eligible again immediately.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, 0.0)
    }

    /// Un-jittered delay after `failures` failures (1-based).
    pub fn base_delay_for(&self, failures: u32) -> Duration {
        if failures == 0 || self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = (failures - 1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn delay_for(&self, failures: u32) -> Duration {
        let delay = self.base_delay_for(failures);
        if delay.is_zero() || self.jitter == 0.0 {
            return delay;
        }
        let cut = rand::thread_rng().gen_range(0.0..=self.jitter);
        delay.mul_f64(1.0 - cut)
    }

    /// When a task that has now failed `failures` times may run again.
    /// `None` means immediately.
    pub fn retry_after(&self, failures: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let delay = self.delay_for(failures);
        if delay.is_zero() {
            return None;
        }
        Some(deadline_after(now, delay))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(600), 0.2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_policy_never_delays() {
        let policy = RetryPolicy::immediate();
        assert_eq!(policy.delay_for(1), Duration::ZERO);
        assert_eq!(policy.retry_after(5, Utc::now()), None);
    }

    #[test]
    fn delay_doubles_until_capped() {
        let policy = RetryPolicy::new(Duration::from_secs(10), Duration::from_secs(60), 0.0);
        assert_eq!(policy.base_delay_for(1), Duration::from_secs(10));
        assert_eq!(policy.base_delay_for(2), Duration::from_secs(20));
        assert_eq!(policy.base_delay_for(3), Duration::from_secs(40));
        assert_eq!(policy.base_delay_for(4), Duration::from_secs(60));
        assert_eq!(policy.base_delay_for(40), Duration::from_secs(60));
    }

    #[test]
    fn jitter_only_shortens() {
        let policy = RetryPolicy::new(Duration::from_secs(100), Duration::from_secs(100), 0.5);
        for _ in 0..50 {
            let d = policy.delay_for(1);
            assert!(d <= Duration::from_secs(100));
            assert!(d >= Duration::from_secs(50));
        }
    }

    #[test]
    fn retry_after_is_in_the_future() {
        let now = Utc::now();
        let policy = RetryPolicy::new(Duration::from_secs(30), Duration::from_secs(30), 0.0);
        assert_eq!(
            policy.retry_after(1, now),
            Some(now + chrono::Duration::seconds(30))
        );
    }

    #[test]
    fn enormous_delay_still_lies_in_the_future() {
        let now = Utc::now();
        let policy = RetryPolicy::new(Duration::MAX, Duration::MAX, 0.0);
        let at = policy.retry_after(1, now).unwrap();
        assert!(at > now + chrono::Duration::days(365 * 1000));
    }

    #[test]
    fn jitter_is_clamped() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(1), 7.0);
        assert_eq!(policy.jitter, 1.0);
    }
}
