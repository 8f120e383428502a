//! Bounded retry policy for transient delivery failures.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// What to do after a transient failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try the same message again at `run_at`; this will be retry number `attempt`.
    Retry { attempt: u32, run_at: DateTime<Utc> },
    /// Retry budget spent; the track halts at this step.
    Exhausted,
}

/// Maximum retry count plus a widening backoff schedule.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Delay before retry 1, 2, 3... The last entry repeats if the list is short.
    pub backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: vec![
                Duration::from_secs(2 * 60),
                Duration::from_secs(5 * 60),
                Duration::from_secs(10 * 60),
            ],
        }
    }
}

impl RetryPolicy {
    /// Decide the follow-up for a message that has already used `retries_so_far` retries.
    pub fn decide(&self, retries_so_far: u32, now: DateTime<Utc>) -> RetryDecision {
        if retries_so_far >= self.max_retries {
            return RetryDecision::Exhausted;
        }
        let attempt = retries_so_far + 1;
        let delay = chrono::Duration::from_std(self.delay_for(attempt))
            .unwrap_or(chrono::Duration::minutes(10));
        RetryDecision::Retry {
            attempt,
            run_at: now + delay,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let idx = (attempt.saturating_sub(1) as usize).min(self.backoff.len().saturating_sub(1));
        self.backoff
            .get(idx)
            .copied()
            .unwrap_or(Duration::from_secs(60))
    }
}
