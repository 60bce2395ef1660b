//! Retry policy: exponential backoff with jitter.
//!
//! The un-jittered delay for attempt `n` (1-based) is `base * 2^(n-1)`, capped at
//! `max`. Jitter perturbs that value uniformly within `±jitter_factor` and the result is
//! clamped back to `max`. Once `attempt > max_retries` the policy gives up.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default jitter: ±20% of the computed delay.
pub const DEFAULT_JITTER_FACTOR: f64 = 0.2;

/// Backoff configuration shared by all jobs of a scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Upper bound for any delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Relative jitter applied to each delay (0.0 disables jitter)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }

    /// Disable jitter, making delays deterministic.
    pub fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }

    /// Un-jittered delay for a 1-based attempt number.
    pub fn backoff_center(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.base_delay.as_secs_f64() * 2f64.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Delay before retrying after `attempt` failed, or `None` to give up.
    ///
    /// `attempt` is the number of the attempt that just failed; the first retry is
    /// requested with `attempt = 1`.
    pub fn next_retry_delay(&self, attempt: u32, max_retries: u32) -> Option<Duration> {
        if attempt == 0 || attempt > max_retries {
            return None;
        }
        Some(self.jittered(self.backoff_center(attempt)))
    }

    fn jittered(&self, center: Duration) -> Duration {
        if self.jitter_factor <= 0.0 || center.is_zero() {
            return center;
        }
        let factor = self.jitter_factor.min(1.0);
        let offset = rand::thread_rng().gen_range(-factor..=factor);
        let secs = center.as_secs_f64() * (1.0 + offset);
        Duration::from_secs_f64(secs.clamp(0.0, self.max_delay.as_secs_f64()))
    }
}

/// Convenience wrapper over [`RetryPolicy::next_retry_delay`] with default jitter.
pub fn next_retry_delay(attempt: u32, max_retries: u32, base_delay: Duration, max_delay: Duration) -> Option<Duration> {
    RetryPolicy::new(base_delay, max_delay).next_retry_delay(attempt, max_retries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_centers_double_then_cap() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60));
        let centers: Vec<u64> = (1..=8).map(|a| policy.backoff_center(a).as_secs()).collect();
        assert_eq!(centers, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_center(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_gives_up_after_max_retries() {
        let policy = RetryPolicy::default().without_jitter();
        assert_eq!(policy.next_retry_delay(1, 3), Some(Duration::from_secs(1)));
        assert_eq!(policy.next_retry_delay(3, 3), Some(Duration::from_secs(4)));
        assert_eq!(policy.next_retry_delay(4, 3), None);
        assert_eq!(policy.next_retry_delay(1, 0), None);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        for attempt in 1..=10 {
            let center = RetryPolicy::default().backoff_center(attempt).as_secs_f64();
            for _ in 0..100 {
                let delay = next_retry_delay(attempt, 10, Duration::from_secs(1), Duration::from_secs(60))
                    .unwrap()
                    .as_secs_f64();
                assert!(delay >= center * 0.8 - 1e-9, "attempt {}: {} < {}", attempt, delay, center);
                assert!(delay <= (center * 1.2).min(60.0) + 1e-9);
            }
        }
    }
}
