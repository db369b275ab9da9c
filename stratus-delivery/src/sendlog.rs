//! In-memory audit trail of delivery attempts.
//!
//! Entries are appended in time order, updated in place once the outcome of
//! the attempt is known, and pruned from the front as they age out. Readers
//! get copies; the lock is only held for the data-structure operation itself.

use std::collections::VecDeque;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use stratus_common::{AddressList, DeliveryRequest, Recipients};

use crate::transport::TransportReceipt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Pending,
    Ok,
    Requeue,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditLogEntry {
    pub id: u64,
    pub time: DateTime<Utc>,
    /// Who the message claims to be from: its reply-to list, or the relay's
    /// own sender address when that is empty.
    pub from: AddressList,
    pub to: Recipients,
    pub subject: String,
    pub transport_result: Option<TransportReceipt>,
    pub status: AuditStatus,
    pub remaining_attempts: u32,
    pub error: Option<String>,
}

#[derive(Default)]
struct Entries {
    entries: VecDeque<AuditLogEntry>,
    next_id: u64,
}

#[derive(Default)]
pub struct SendLog {
    inner: Mutex<Entries>,
}

impl SendLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a [`AuditStatus::Pending`] entry for an attempt at `request`,
    /// returning its id.
    ///
    /// Timestamps never go backwards, so the log stays sorted even if the
    /// clock does.
    pub fn begin(
        &self,
        request: &DeliveryRequest,
        remaining_attempts: u32,
        now: DateTime<Utc>,
    ) -> u64 {
        let from = if request.reply_to().is_empty() {
            AddressList::from_input(request.sender_address()).unwrap_or_default()
        } else {
            request.reply_to().clone()
        };

        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        let time = inner
            .entries
            .back()
            .map_or(now, |last| last.time.max(now));

        inner.entries.push_back(AuditLogEntry {
            id,
            time,
            from,
            to: request.recipients().clone(),
            subject: request.subject().to_string(),
            transport_result: None,
            status: AuditStatus::Pending,
            remaining_attempts,
            error: None,
        });

        id
    }

    /// Apply `change` to the entry with `id`, if it has not been pruned.
    pub fn update(&self, id: u64, change: impl FnOnce(&mut AuditLogEntry)) -> bool {
        let mut inner = self.inner.lock();
        let Ok(index) = inner.entries.binary_search_by_key(&id, |entry| entry.id) else {
            return false;
        };

        inner.entries.get_mut(index).is_some_and(|entry| {
            change(entry);
            true
        })
    }

    /// Drop entries older than `retention`, returning how many were removed.
    pub fn prune(&self, now: DateTime<Utc>, retention: TimeDelta) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();

        while inner
            .entries
            .front()
            .is_some_and(|entry| entry.time + retention < now)
        {
            inner.entries.pop_front();
        }

        before - inner.entries.len()
    }

    pub fn snapshot(&self) -> Vec<AuditLogEntry> {
        self.inner.lock().entries.iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}
