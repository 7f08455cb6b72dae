//! In-claim retry policy for the ingest consumer.

use std::time::Duration;

/// Exponential backoff schedule for delivery attempts of one record.
///
/// `max_attempts` counts every invocation including the first; a policy of
/// 3 attempts therefore sleeps at most twice. Retries happen inside the
/// held idempotency claim and block the partition, preserving bus order.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_secs(1),
            multiplier: 2.0,
            max_interval: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_interval: Duration,
        multiplier: f64,
        max_interval: Duration,
    ) -> Self {
        Self {
            max_attempts,
            initial_interval,
            multiplier,
            max_interval,
        }
    }

    /// Backoff to observe after the given failed attempt (1-based).
    pub fn delay_after_attempt(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial_interval.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_interval.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after_attempt(3), Duration::from_secs(4));
        // Capped at the max interval from here on.
        assert_eq!(policy.delay_after_attempt(4), Duration::from_secs(5));
        assert_eq!(policy.delay_after_attempt(10), Duration::from_secs(5));
    }
}
