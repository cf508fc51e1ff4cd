//! Backoff and parking after rolled-back failures.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use nestbox_core::config::RetryConfig;
use tokio::time::Instant;

/// What the poll loop should do with a group after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry once the delay has passed.
    Backoff(Duration),
    /// Out of attempts; wait for a newer message.
    Parked,
}

#[derive(Debug, Clone, Copy)]
struct GroupRetry {
    attempts: u32,
    not_before: Instant,
    /// Latest message timestamp of the batch that exhausted its attempts.
    parked_at: Option<i64>,
}

pub struct RetryTracker {
    max_attempts: u32,
    base_delay: Duration,
    groups: Mutex<HashMap<String, GroupRetry>>,
}

impl RetryTracker {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            groups: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, Duration::from_millis(config.base_delay_ms))
    }

    /// `base * 2^(attempt-1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << exponent)
    }

    /// Record a rolled-back failure of a batch ending at `batch_latest`.
    pub fn record_failure(&self, folder: &str, batch_latest: i64) -> RetryDecision {
        let mut groups = self.groups.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = groups.entry(folder.to_string()).or_insert(GroupRetry {
            attempts: 0,
            not_before: Instant::now(),
            parked_at: None,
        });
        entry.attempts += 1;
        if entry.attempts >= self.max_attempts {
            entry.parked_at = Some(batch_latest);
            RetryDecision::Parked
        } else {
            let delay = self.delay_for(entry.attempts);
            entry.not_before = Instant::now() + delay;
            entry.parked_at = None;
            RetryDecision::Backoff(delay)
        }
    }

    pub fn record_success(&self, folder: &str) {
        self.groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(folder);
    }

    /// Whether the poll loop must leave `folder` alone for now, given the
    /// newest pending message.
    pub fn is_blocked(&self, folder: &str, newest_pending: i64) -> bool {
        let groups = self.groups.lock().unwrap_or_else(PoisonError::into_inner);
        match groups.get(folder) {
            None => false,
            Some(GroupRetry {
                parked_at: Some(watermark),
                ..
            }) => newest_pending <= *watermark,
            Some(retry) => Instant::now() < retry.not_before,
        }
    }

    pub fn attempts(&self, folder: &str) -> u32 {
        self.groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(folder)
            .map_or(0, |r| r.attempts)
    }
}
