//! Retry eligibility and backoff policy.
//!
//! Pure and clock-free: callers pass `now` so tests can pin time exactly.

use crate::config::RetryConfig;
use crate::db::{Channel, FetchStatus};

/// Decides whether a channel is due for another fetch attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base_secs: i64,
    ceiling_secs: i64,
    max_attempts: i64,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base_secs: config.backoff_base_secs as i64,
            ceiling_secs: config.backoff_ceiling_secs as i64,
            max_attempts: config.max_attempts as i64,
        }
    }

    /// Required delay in seconds before attempt `attempts + 1`.
    ///
    /// Exponential: `base * 2^(attempts - 1)`, saturating at the ceiling.
    /// Zero attempts means no delay.
    pub fn backoff_secs(&self, attempts: i64) -> i64 {
        if attempts <= 0 {
            return 0;
        }
        let exp = (attempts - 1).min(32) as u32;
        self.base_secs
            .saturating_mul(1_i64 << exp)
            .min(self.ceiling_secs)
    }

    /// Whether the attempt counter has crossed the permanent-failure ceiling.
    pub fn is_exhausted(&self, attempts: i64) -> bool {
        attempts >= self.max_attempts
    }

    /// Whether the channel may be fetched at `now` (epoch seconds).
    ///
    /// Permanently failed channels are never eligible, regardless of elapsed
    /// time; clearing that state takes an operator reset. A channel stuck
    /// `in_progress` past its backoff window is eligible again — that is the
    /// crash-recovery signal for an abandoned in-flight fetch.
    pub fn eligible(&self, channel: &Channel, now: i64) -> bool {
        if channel.fetch_status == FetchStatus::FailedPermanently
            || self.is_exhausted(channel.fetch_attempts)
        {
            return false;
        }
        if channel.fetch_status == FetchStatus::Unattempted {
            return true;
        }
        match channel.last_attempt_at {
            None => true,
            Some(last) => now - last >= self.backoff_secs(channel.fetch_attempts),
        }
    }
}
