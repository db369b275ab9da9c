use std::sync::Arc;

use chrono::{DateTime, Utc};
use stratus_common::DeliveryRequest;

/// One scheduled delivery attempt.
///
/// The request is shared between successive attempts; only the retry
/// bookkeeping changes.
#[derive(Debug, Clone)]
pub struct RetryJob {
    pub request: Arc<DeliveryRequest>,
    pub remaining_attempts: u32,
    /// The queue will not hand the job to a worker before this instant.
    pub not_before: DateTime<Utc>,
    /// When this job entered the queue; used for the queue age limit.
    pub submitted_at: DateTime<Utc>,
}
