//! Retry gating for failed transfers.
//!
//! The manager's periodic sweep asks the [`RetryPolicy`] whether a failed
//! record may be re-queued yet.
//!
//! # Overview
//!
//! - [`RetryPolicy::Fixed`] - re-queue on the next sweep; the sweep interval
//!   is the only backoff (default)
//! - [`RetryPolicy::Exponential`] - wait `base * multiplier^retry_count`
//!   (capped, plus jitter) after the failure before re-queueing
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use download_manager::download::{RetryDecision, RetryPolicy};
//!
//! let policy = RetryPolicy::exponential(Duration::from_secs(1), Duration::from_secs(32));
//! match policy.should_retry(0, 3, Duration::from_secs(10)) {
//!     RetryDecision::Retry => println!("re-queue now"),
//!     RetryDecision::Wait { remaining } => println!("wait {remaining:?}"),
//!     RetryDecision::DoNotRetry { reason } => println!("giving up: {reason}"),
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// Default base delay for exponential backoff (1 second).
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap (32 seconds).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);

/// Default backoff multiplier (doubles each retry).
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Maximum jitter added to exponential delays (500ms).
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Decision on whether a failed transfer should be re-queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-queue the transfer now.
    Retry,

    /// Retryable, but the backoff has not elapsed yet.
    Wait {
        /// Time left before the transfer becomes eligible.
        remaining: Duration,
    },

    /// Retry budget exhausted.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Backoff applied between a failure and the sweep re-queueing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Eligible on the first sweep after the failure.
    #[default]
    Fixed,

    /// Delay grows with the retry count.
    ///
    /// ```text
    /// delay = min(base_delay * multiplier^retry_count, max_delay) + jitter
    /// ```
    Exponential {
        base_delay: Duration,
        max_delay: Duration,
        multiplier: f32,
        jitter: bool,
    },
}

impl RetryPolicy {
    /// Exponential backoff doubling from `base_delay`, capped at `max_delay`, with jitter.
    #[must_use]
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self::Exponential {
            base_delay,
            max_delay,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter: true,
        }
    }

    /// Exponential backoff with the crate defaults (1s base, 32s cap).
    #[must_use]
    pub fn default_exponential() -> Self {
        Self::exponential(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }

    /// Decides whether a failed transfer may be re-queued.
    ///
    /// # Arguments
    ///
    /// * `retry_count` - Retries already consumed by the transfer
    /// * `max_retries` - The transfer's retry budget
    /// * `since_failure` - Time elapsed since the failed attempt ended
    #[instrument(level = "trace", skip(self))]
    pub fn should_retry(
        &self,
        retry_count: u32,
        max_retries: u32,
        since_failure: Duration,
    ) -> RetryDecision {
        if retry_count >= max_retries {
            debug!(retry_count, max_retries, "retry budget exhausted");
            return RetryDecision::DoNotRetry {
                reason: format!("max retries ({max_retries}) exhausted"),
            };
        }

        let delay = self.delay_for(retry_count);
        if since_failure >= delay {
            RetryDecision::Retry
        } else {
            RetryDecision::Wait {
                remaining: delay - since_failure,
            }
        }
    }

    /// Backoff owed before the next attempt of a transfer with `retry_count` retries.
    #[must_use]
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        match self {
            Self::Fixed => Duration::ZERO,
            Self::Exponential {
                base_delay,
                max_delay,
                multiplier,
                jitter,
            } => {
                let capped = exponential_delay(*base_delay, *max_delay, *multiplier, retry_count);
                if *jitter {
                    capped + random_jitter()
                } else {
                    capped
                }
            }
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn exponential_delay(
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f32,
    retry_count: u32,
) -> Duration {
    let base_ms = base_delay.as_millis() as f64;
    let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
    let delay_ms = base_ms * f64::from(multiplier).powi(exponent);
    let max_ms = max_delay.as_millis() as f64;
    Duration::from_millis(delay_ms.min(max_ms).max(0.0) as u64)
}

#[allow(clippy::cast_possible_truncation)]
fn random_jitter() -> Duration {
    let max = MAX_JITTER.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=max))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn no_jitter(base_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy::Exponential {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_fixed_policy_retries_immediately_within_budget() {
        let policy = RetryPolicy::Fixed;
        assert_eq!(policy.should_retry(0, 3, Duration::ZERO), RetryDecision::Retry);
        assert_eq!(policy.should_retry(2, 3, Duration::ZERO), RetryDecision::Retry);
    }

    #[test]
    fn test_budget_exhausted_never_retries() {
        let policy = RetryPolicy::Fixed;
        let decision = policy.should_retry(3, 3, Duration::from_secs(3600));
        assert!(matches!(decision, RetryDecision::DoNotRetry { .. }));

        let decision = policy.should_retry(0, 0, Duration::from_secs(3600));
        assert!(matches!(decision, RetryDecision::DoNotRetry { ref reason } if reason.contains("0")));
    }

    #[test]
    fn test_exponential_delay_doubles_and_caps() {
        let policy = no_jitter(1000, 5000);
        assert_eq!(policy.delay_for(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(5000));
        assert_eq!(policy.delay_for(30), Duration::from_millis(5000));
    }

    #[test]
    fn test_exponential_waits_until_delay_elapsed() {
        let policy = no_jitter(1000, 32_000);
        assert_eq!(
            policy.should_retry(1, 3, Duration::from_millis(500)),
            RetryDecision::Wait {
                remaining: Duration::from_millis(1500)
            }
        );
        assert_eq!(
            policy.should_retry(1, 3, Duration::from_millis(2000)),
            RetryDecision::Retry
        );
    }

    #[test]
    fn test_jitter_stays_within_bound() {
        let policy = RetryPolicy::exponential(Duration::from_millis(100), Duration::from_secs(1));
        for _ in 0..50 {
            let delay = policy.delay_for(0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(100) + MAX_JITTER);
        }
    }

    #[test]
    fn test_policy_serde_tagged() {
        let json = serde_json::to_value(RetryPolicy::Fixed).unwrap();
        assert_eq!(json["kind"], "fixed");
        let back: RetryPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(back, RetryPolicy::Fixed);
    }
}
