//! Retry decisions for failed executions.
//!
//! Stateless: all logic lives in associated functions that take the policy
//! as a parameter, so the same handler serves the manager, `supervised_run`,
//! and the CLI.

use std::time::Duration;

use flowstate_types::config::RetryPolicy;
use flowstate_types::execution::FailureRecord;

// ---------------------------------------------------------------------------
// RetryHandler
// ---------------------------------------------------------------------------

pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt should follow the failed `attempt` (1-based).
    ///
    /// Only failures marked retryable are retried, and never past
    /// `policy.max_attempts` attempts in total.
    pub fn should_retry(policy: &RetryPolicy, attempt: u32, failure: &FailureRecord) -> bool {
        failure.retryable && attempt < policy.max_attempts
    }

    /// How long to wait after the failed `attempt` before the next one.
    pub fn delay_for(policy: &RetryPolicy, attempt: u32) -> Duration {
        policy.backoff.delay(attempt)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
