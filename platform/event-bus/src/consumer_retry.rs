//! Consumer retry policy with exponential backoff
//!
//! Failed deliveries are retried by republishing a copy to the tail of the
//! queue with an incremented `x-retry-count`. Once the retry budget is spent the
//! delivery is rejected and the broker moves it to the dead-letter queue.

use std::time::Duration;

/// Configuration for requeue behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of requeues after the first attempt
    pub max_retries: u32,
    /// Delay before the first requeue (doubles on each retry)
    pub initial_backoff: Duration,
    /// Maximum backoff duration to cap exponential growth
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// What to do with a delivery whose processing failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Republish with `next_retry_count` after waiting `delay`, then ack the original
    Requeue { next_retry_count: u32, delay: Duration },
    /// Reject without requeue so the broker dead-letters it
    DeadLetter,
}

impl RetryPolicy {
    /// Policy that requeues immediately (tests, drills)
    pub fn without_backoff(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Decide based on the failed delivery's current retry count
    pub fn decide(&self, retry_count: u32) -> RetryDecision {
        if retry_count < self.max_retries {
            RetryDecision::Requeue {
                next_retry_count: retry_count + 1,
                delay: self.backoff_for(retry_count),
            }
        } else {
            RetryDecision::DeadLetter
        }
    }

    /// Exponential backoff with cap: `initial * 2^retry_count`, at most `max_backoff`
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry_count);
        std::cmp::min(
            self.initial_backoff.saturating_mul(factor),
            self.max_backoff,
        )
    }

    /// Total number of processing attempts a message gets
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requeues_until_budget_spent() {
        let policy = RetryPolicy::without_backoff(3);

        for retry_count in 0..3 {
            assert_eq!(
                policy.decide(retry_count),
                RetryDecision::Requeue {
                    next_retry_count: retry_count + 1,
                    delay: Duration::ZERO,
                }
            );
        }
        assert_eq!(policy.decide(3), RetryDecision::DeadLetter);
        assert_eq!(policy.decide(7), RetryDecision::DeadLetter);
        assert_eq!(policy.max_attempts(), 4);
    }

    #[test]
    fn test_zero_retries_dead_letters_first_failure() {
        let policy = RetryPolicy::without_backoff(0);

        assert_eq!(policy.decide(0), RetryDecision::DeadLetter);
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        };

        assert_eq!(policy.backoff_for(0), Duration::from_millis(10));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(20));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(40));
        // Capped
        assert_eq!(policy.backoff_for(3), Duration::from_millis(50));
        assert_eq!(policy.backoff_for(40), Duration::from_millis(50));
    }

    #[test]
    fn test_decide_carries_backoff() {
        let policy = RetryPolicy::default();

        assert_eq!(
            policy.decide(1),
            RetryDecision::Requeue {
                next_retry_count: 2,
                delay: Duration::from_millis(200),
            }
        );
    }
}
