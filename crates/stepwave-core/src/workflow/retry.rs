//! Retry policy for failed steps.
//!
//! Stateless: the attempt counter lives on the step entry, the policy only
//! answers "retry again?" and "after how long?".

use std::time::Duration;

use stepwave_types::config::EngineConfig;

/// Largest exponent applied to the base delay.
const MAX_BACKOFF_SHIFT: u32 = 16;

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.max_retries, config.retry_base_delay())
    }

    /// Whether a step that has already been retried `retry_count` times may
    /// be retried again.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Delay before the next attempt: `base * 2^retry_count`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 1u32 << retry_count.min(MAX_BACKOFF_SHIFT);
        self.base_delay.saturating_mul(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_retry_respects_max() {
        let policy = RetryPolicy::new(3, Duration::from_secs(5));
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(10));
    }

    #[test]
    fn test_zero_max_never_retries() {
        let policy = RetryPolicy::new(0, Duration::from_secs(5));
        assert!(!policy.should_retry(0));
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::new(3, Duration::from_secs(5));
        assert_eq!(policy.backoff(0), Duration::from_secs(5));
        assert_eq!(policy.backoff(1), Duration::from_secs(10));
        assert_eq!(policy.backoff(2), Duration::from_secs(20));
    }

    #[test]
    fn test_backoff_is_bounded() {
        let policy = RetryPolicy::new(100, Duration::from_millis(1));
        assert_eq!(policy.backoff(40), policy.backoff(MAX_BACKOFF_SHIFT));
    }

    #[test]
    fn test_from_config_defaults() {
        let policy = RetryPolicy::from_config(&EngineConfig::default());
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(5));
    }
}
