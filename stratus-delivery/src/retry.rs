//! Fixed-delay retry budget for delivery attempts.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use stratus_common::DeliveryRequest;

use crate::types::RetryJob;

/// How many times a failed send is retried, and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    ///
    /// Default: 3
    #[serde(default = "defaults::message_retry")]
    pub message_retry: u32,

    /// Seconds between attempts.
    ///
    /// Default: 3600 seconds (1 hour)
    #[serde(default = "defaults::message_retry_delay")]
    pub message_retry_delay: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            message_retry: defaults::message_retry(),
            message_retry_delay: defaults::message_retry_delay(),
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self) -> TimeDelta {
        TimeDelta::seconds(i64::try_from(self.message_retry_delay).unwrap_or(i64::MAX))
    }

    /// A fresh job carrying the full retry budget, due immediately.
    pub fn initial_job(&self, request: Arc<DeliveryRequest>, now: DateTime<Utc>) -> RetryJob {
        RetryJob {
            request,
            remaining_attempts: self.message_retry,
            not_before: now,
            submitted_at: now,
        }
    }

    /// The follow-up for a failed attempt, or `None` once the budget is spent.
    pub fn next_attempt(&self, job: &RetryJob, now: DateTime<Utc>) -> Option<RetryJob> {
        let remaining_attempts = job.remaining_attempts.checked_sub(1)?;

        Some(RetryJob {
            request: Arc::clone(&job.request),
            remaining_attempts,
            not_before: now + self.delay(),
            submitted_at: now,
        })
    }
}

mod defaults {
    pub const fn message_retry() -> u32 {
        3
    }

    pub const fn message_retry_delay() -> u64 {
        3600
    }
}
