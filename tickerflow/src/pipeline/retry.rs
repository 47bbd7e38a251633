//! Retry policy with configurable backoff and jitter strategies.
//!
//! The policy is stateless: every decision is a function of the error and
//! the number of retries already performed for a unit of work.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::StageError;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^(retry - 1)
    #[default]
    Exponential,
    /// delay = base * retry
    Linear,
    /// delay = base (constant)
    Constant,
}

/// Jitter strategy to spread retries of many symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    #[default]
    None,
    /// Random from 0 to delay
    Full,
    /// Half fixed, half random
    Equal,
}

/// Decides whether a failed unit is retried and how long to wait.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum stage-function invocations per unit, including the first.
    pub max_attempts: u32,
    /// Base delay between retries in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff strategy.
    pub backoff_strategy: BackoffStrategy,
    /// Jitter strategy.
    pub jitter_strategy: JitterStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_strategy: BackoffStrategy::Exponential,
            jitter_strategy: JitterStrategy::None,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::default().with_max_attempts(1)
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter_strategy = strategy;
        self
    }

    /// Validates the policy configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts < 1 {
            return Err("max_attempts must be >= 1".to_string());
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err("base_delay_ms must not exceed max_delay_ms".to_string());
        }
        Ok(())
    }

    /// Returns true if another invocation fits under the attempt ceiling.
    ///
    /// `retry_count` is the number of retries already performed.
    #[must_use]
    pub const fn has_attempts_left(&self, retry_count: u32) -> bool {
        retry_count.saturating_add(1) < self.max_attempts
    }

    /// Returns true if the error should be retried after `retry_count` retries.
    #[must_use]
    pub fn should_retry(&self, error: &StageError, retry_count: u32) -> bool {
        error.is_retryable() && self.has_attempts_left(retry_count)
    }

    /// Returns how long to wait before retry number `retry` (1-based).
    #[must_use]
    pub fn wait_for_retry(&self, retry: u32) -> Duration {
        let base = self.base_delay_ms;
        let max = self.max_delay_ms;
        let step = retry.max(1);

        let delay = match self.backoff_strategy {
            BackoffStrategy::Exponential => {
                let factor = 2u64.saturating_pow(step - 1);
                base.saturating_mul(factor).min(max)
            }
            BackoffStrategy::Linear => base.saturating_mul(u64::from(step)).min(max),
            BackoffStrategy::Constant => base.min(max),
        };

        let jittered = match self.jitter_strategy {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };

        Duration::from_millis(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> StageError {
        StageError::transient("connection reset")
    }

    #[test]
    fn test_backoff_strategy_default() {
        assert_eq!(BackoffStrategy::default(), BackoffStrategy::Exponential);
    }

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay_ms, 1000);
        assert_eq!(policy.max_delay_ms, 30000);
        assert_eq!(policy.jitter_strategy, JitterStrategy::None);
    }

    #[test]
    fn test_retry_policy_builder() {
        let policy = RetryPolicy::new()
            .with_max_attempts(5)
            .with_base_delay_ms(500)
            .with_max_delay_ms(10000)
            .with_backoff(BackoffStrategy::Linear)
            .with_jitter(JitterStrategy::Equal);

        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay_ms, 500);
        assert_eq!(policy.backoff_strategy, BackoffStrategy::Linear);
        assert_eq!(policy.jitter_strategy, JitterStrategy::Equal);
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::new().validate().is_ok());
        assert!(RetryPolicy::new().with_max_attempts(0).validate().is_err());
        assert!(RetryPolicy::new()
            .with_base_delay_ms(5000)
            .with_max_delay_ms(100)
            .validate()
            .is_err());
    }

    #[test]
    fn test_should_retry_respects_ceiling() {
        let policy = RetryPolicy::new().with_max_attempts(3);

        assert!(policy.should_retry(&transient(), 0));
        assert!(policy.should_retry(&transient(), 1));
        assert!(!policy.should_retry(&transient(), 2));
    }

    #[test]
    fn test_should_retry_rejects_permanent() {
        let policy = RetryPolicy::new().with_max_attempts(10);
        assert!(!policy.should_retry(&StageError::permanent("unknown ticker"), 0));
    }

    #[test]
    fn test_no_retry_policy() {
        let policy = RetryPolicy::no_retry();
        assert!(!policy.should_retry(&transient(), 0));
    }

    #[test]
    fn test_wait_exponential_no_jitter() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Exponential);

        assert_eq!(policy.wait_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.wait_for_retry(2), Duration::from_millis(200));
        assert_eq!(policy.wait_for_retry(3), Duration::from_millis(400));
    }

    #[test]
    fn test_wait_linear_no_jitter() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Linear);

        assert_eq!(policy.wait_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.wait_for_retry(3), Duration::from_millis(300));
    }

    #[test]
    fn test_wait_constant_no_jitter() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Constant);

        assert_eq!(policy.wait_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.wait_for_retry(6), Duration::from_millis(100));
    }

    #[test]
    fn test_wait_capped_at_max() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(1000)
            .with_max_delay_ms(5000);

        assert_eq!(policy.wait_for_retry(11), Duration::from_millis(5000));
        assert_eq!(policy.wait_for_retry(200), Duration::from_millis(5000));
    }

    #[test]
    fn test_wait_full_jitter_bounded() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Constant)
            .with_jitter(JitterStrategy::Full);

        for _ in 0..20 {
            assert!(policy.wait_for_retry(1) <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_wait_equal_jitter_bounded() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Constant)
            .with_jitter(JitterStrategy::Equal);

        for _ in 0..20 {
            let delay = policy.wait_for_retry(1);
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_policy_deserializes_with_defaults() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"max_attempts": 2, "backoff_strategy": "linear"}"#).unwrap();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.backoff_strategy, BackoffStrategy::Linear);
        assert_eq!(policy.base_delay_ms, 1000);
    }
}
