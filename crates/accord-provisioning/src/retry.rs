//! Exponential backoff between task attempts

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;

/// Backoff policy for failed tasks.
///
/// The delay before attempt `n + 1` is `min(base * 2^n, max)`, where `n` is
/// the task's retry count before the failure.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    /// Base delay in seconds.
    pub base_delay_secs: u64,
    /// Maximum delay cap in seconds.
    pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_secs: 60,
            max_delay_secs: 3600,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay_secs: u64, max_delay_secs: u64) -> Self {
        Self {
            base_delay_secs,
            max_delay_secs,
        }
    }

    #[must_use]
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let exponential = self
            .base_delay_secs
            .saturating_mul(2u64.saturating_pow(retry_count));
        Duration::from_secs(exponential.min(self.max_delay_secs))
    }

    /// When the next attempt becomes due
    pub fn next_attempt_at(&self, now: DateTime<Utc>, retry_count: u32) -> DateTime<Utc> {
        let secs = i64::try_from(self.backoff(retry_count).as_secs()).unwrap_or(i64::MAX);
        now.checked_add_signed(chrono::Duration::seconds(secs.min(i64::MAX / 1000)))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
