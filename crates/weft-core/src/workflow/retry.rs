//! Retry decisions for failed activity attempts.
//!
//! Stateless: all logic lives in associated functions that take the policy as
//! a parameter. Activities without a `RetryPolicy` are never retried.

use std::time::Duration;

use weft_types::workflow::{ActivityFailure, FailureKind, RetryPolicy};

pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt should be made after `attempt` failed.
    ///
    /// `attempt` is 1-based. Invalid input is never retried since the same
    /// input will fail the same way.
    pub fn should_retry(policy: &RetryPolicy, attempt: u32, failure: &ActivityFailure) -> bool {
        if attempt >= policy.max_attempts {
            return false;
        }
        match failure.kind {
            FailureKind::Execution => true,
            FailureKind::Timeout => policy.retry_timeouts,
            FailureKind::InvalidInput => false,
        }
    }

    /// Delay before the attempt following `attempt`.
    ///
    /// `initial * multiplier^(attempt - 1)`, capped at `max_backoff_ms`.
    pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = policy.initial_backoff_ms as f64 * policy.backoff_multiplier.powi(exponent);
        let capped = if millis.is_finite() {
            millis.min(policy.max_backoff_ms as f64)
        } else {
            policy.max_backoff_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }
}
