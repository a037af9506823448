//! Per-key retry delays

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Decides how long a failing key waits before it is retried
pub trait RateLimiter: Send + Sync {
    /// Delay before the next retry of `key`, counting this retry
    fn when(&self, key: &str) -> Duration;

    /// Stop tracking `key`, its next failure starts from the base delay
    fn forget(&self, key: &str);

    /// Retries of `key` since it was last forgotten
    fn num_requeues(&self, key: &str) -> u32;
}

/// `base * 2^failures`, capped at `max`
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn delay(&self, failures: u32) -> Duration {
        2u32.checked_pow(failures)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}

impl RateLimiter for ExponentialBackoff {
    fn when(&self, key: &str) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(key.to_string()).or_insert(0);
        let delay = self.delay(*count);
        *count = count.saturating_add(1);
        delay
    }

    fn forget(&self, key: &str) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    fn num_requeues(&self, key: &str) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let limiter = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1));
        let delays: Vec<Duration> = (0..6).map(|_| limiter.when("ns/a")).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_secs(1),
                Duration::from_secs(1),
            ]
        );
        assert_eq!(limiter.num_requeues("ns/a"), 6);
    }

    #[test]
    fn keys_are_independent() {
        let limiter = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(1));
        limiter.when("a");
        limiter.when("a");
        assert_eq!(limiter.when("b"), Duration::from_millis(10));
        assert_eq!(limiter.num_requeues("a"), 2);
    }

    #[test]
    fn forget_resets() {
        let limiter = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(1));
        limiter.when("a");
        limiter.when("a");
        limiter.forget("a");
        assert_eq!(limiter.num_requeues("a"), 0);
        assert_eq!(limiter.when("a"), Duration::from_millis(10));
    }

    #[test]
    fn huge_failure_counts_do_not_overflow() {
        let limiter = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(300));
        assert_eq!(limiter.delay(64), Duration::from_secs(300));
        assert_eq!(limiter.delay(u32::MAX), Duration::from_secs(300));
    }
}
