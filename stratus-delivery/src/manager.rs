//! The retry state machine.
//!
//! ```text
//! Queued -> Attempting -> Succeeded
//!                      -> RequeuedWithDelay -> Queued
//!                      -> Failed
//! ```
//!
//! Each attempt leaves exactly one entry in the [`SendLog`] (when enabled),
//! written as `Pending` before the transport is called and settled once the
//! outcome is known.

use std::{sync::Arc, time::Duration};

use chrono::TimeDelta;
use serde::Deserialize;
use stratus_common::{DeliveryRequest, internal, tracing};

use crate::{
    clock::Clock,
    error::{QueueError, TransportError},
    queue::Scheduler,
    retry::RetryPolicy,
    sendlog::{AuditLogEntry, AuditStatus, SendLog},
    transport::{Transport, TransportReceipt},
    types::RetryJob,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct DeliveryConfig {
    #[serde(flatten)]
    pub retry: RetryPolicy,

    /// Days an audit entry is kept.
    ///
    /// Default: 72
    #[serde(default = "defaults::retain_log_days")]
    pub retain_log_days: u32,

    /// Seconds a single transport call may take.
    ///
    /// Default: 30
    #[serde(default = "defaults::send_timeout")]
    pub send_timeout: u64,

    #[serde(default = "defaults::enable_send_log")]
    pub enable_send_log: bool,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            retain_log_days: defaults::retain_log_days(),
            send_timeout: defaults::send_timeout(),
            enable_send_log: defaults::enable_send_log(),
        }
    }
}

impl DeliveryConfig {
    pub fn retention(&self) -> TimeDelta {
        TimeDelta::days(i64::from(self.retain_log_days))
    }

    pub const fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout)
    }
}

mod defaults {
    pub const fn retain_log_days() -> u32 {
        72
    }

    pub const fn send_timeout() -> u64 {
        30
    }

    pub const fn enable_send_log() -> bool {
        true
    }
}

/// How a single attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    Requeued,
    Failed,
}

pub struct DeliveryManager {
    config: DeliveryConfig,
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
    log: SendLog,
    clock: Arc<dyn Clock>,
}

impl DeliveryManager {
    pub fn new(
        config: DeliveryConfig,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            transport,
            scheduler,
            log: SendLog::new(),
            clock,
        }
    }

    pub const fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    pub const fn log(&self) -> &SendLog {
        &self.log
    }

    pub fn queue_depth(&self) -> usize {
        self.scheduler.depth()
    }

    pub fn audit_log_snapshot(&self) -> Vec<AuditLogEntry> {
        self.log.snapshot()
    }

    pub fn clear_log(&self) {
        self.log.clear();
    }

    /// Queue `request` for an immediate first attempt with the full retry budget.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Full`] if the queue has no room.
    pub fn submit(&self, request: DeliveryRequest) -> Result<(), QueueError> {
        let job = self
            .config
            .retry
            .initial_job(Arc::new(request), self.clock.now());

        internal!(
            level = DEBUG,
            "Queueing '{}' with {} retries",
            job.request.subject(),
            job.remaining_attempts
        );
        self.scheduler.submit(job)
    }

    /// Make one delivery attempt for `job` and act on the result.
    #[tracing::instrument(
        level = tracing::Level::DEBUG,
        skip_all,
        fields(subject = job.request.subject(), remaining_attempts = job.remaining_attempts)
    )]
    pub async fn attempt(&self, job: RetryJob) -> AttemptOutcome {
        let entry = self.config.enable_send_log.then(|| {
            self.log
                .begin(&job.request, job.remaining_attempts, self.clock.now())
        });

        let timeout = self.config.send_timeout();
        let result = tokio::time::timeout(timeout, self.transport.send(&job.request, timeout))
            .await
            .unwrap_or_else(|_| Err(TransportError::Timeout(timeout)));

        let outcome = match result {
            Ok(receipt) if receipt.is_success() => {
                tracing::info!(
                    id = receipt.id.as_deref().unwrap_or_default(),
                    "Message '{}' sent to {}",
                    job.request.subject(),
                    job.request.recipients().to
                );
                self.settle(entry, AuditStatus::Ok, Some(receipt), None);
                AttemptOutcome::Succeeded
            }
            Ok(receipt) => {
                let error = receipt
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("send finished with status {}", receipt.status));
                self.retry_or_fail(&job, entry, Some(receipt), error)
            }
            Err(err) => {
                if err.is_permanent() {
                    tracing::warn!(transient = false, "Transport error: {err}");
                } else {
                    tracing::debug!(transient = true, "Transport error: {err}");
                }
                self.retry_or_fail(&job, entry, None, err.to_string())
            }
        };

        let pruned = self.log.prune(self.clock.now(), self.config.retention());
        if pruned > 0 {
            internal!(level = DEBUG, "Pruned {pruned} expired send log entries");
        }

        outcome
    }

    fn retry_or_fail(
        &self,
        job: &RetryJob,
        entry: Option<u64>,
        receipt: Option<TransportReceipt>,
        error: String,
    ) -> AttemptOutcome {
        let Some(next) = self.config.retry.next_attempt(job, self.clock.now()) else {
            tracing::error!(
                remaining_attempts = 0,
                "Giving up on '{}' to {}: {error}",
                job.request.subject(),
                job.request.recipients().to
            );
            self.settle(entry, AuditStatus::Failed, receipt, Some(error));
            return AttemptOutcome::Failed;
        };

        let remaining_attempts = next.remaining_attempts;
        let not_before = next.not_before;
        match self.scheduler.submit(next) {
            Ok(()) => {
                tracing::warn!(
                    remaining_attempts,
                    %not_before,
                    "Send of '{}' failed, will retry: {error}",
                    job.request.subject()
                );
                self.settle(entry, AuditStatus::Requeue, receipt, Some(error));
                AttemptOutcome::Requeued
            }
            Err(queue) => {
                tracing::error!(
                    remaining_attempts,
                    "Send of '{}' failed and could not be requeued: {queue}",
                    job.request.subject()
                );
                self.settle(
                    entry,
                    AuditStatus::Failed,
                    receipt,
                    Some(format!("{error}; {queue}")),
                );
                AttemptOutcome::Failed
            }
        }
    }

    fn settle(
        &self,
        entry: Option<u64>,
        status: AuditStatus,
        receipt: Option<TransportReceipt>,
        error: Option<String>,
    ) {
        if let Some(id) = entry {
            self.log.update(id, |record| {
                record.status = status;
                record.transport_result = receipt;
                record.error = error;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use chrono::{TimeDelta, TimeZone, Utc};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use stratus_common::{AddressList, Body, DeliveryRequest, Recipients};

    use super::{AttemptOutcome, DeliveryConfig, DeliveryManager};
    use crate::{
        clock::{Clock, ManualClock},
        error::{QueueError, TransportError},
        queue::Scheduler,
        retry::RetryPolicy,
        sendlog::AuditStatus,
        transport::{Transport, TransportReceipt},
        types::RetryJob,
    };

    /// Hands back queued replies in order, then keeps repeating the last one.
    struct ScriptedTransport {
        replies: Mutex<VecDeque<Result<TransportReceipt, TransportError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Result<TransportReceipt, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(
            &self,
            _request: &DeliveryRequest,
            _timeout: Duration,
        ) -> Result<TransportReceipt, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut replies = self.replies.lock();
            if replies.len() > 1 {
                replies.pop_front().unwrap()
            } else {
                replies.front().cloned().unwrap()
            }
        }
    }

    struct StalledTransport;

    #[async_trait]
    impl Transport for StalledTransport {
        async fn send(
            &self,
            _request: &DeliveryRequest,
            _timeout: Duration,
        ) -> Result<TransportReceipt, TransportError> {
            std::future::pending().await
        }
    }

    /// Collects submitted jobs so the test can replay them.
    #[derive(Default)]
    struct RecordingScheduler {
        jobs: Mutex<VecDeque<RetryJob>>,
        capacity: Option<usize>,
    }

    impl Scheduler for RecordingScheduler {
        fn submit(&self, job: RetryJob) -> Result<(), QueueError> {
            let mut jobs = self.jobs.lock();
            if let Some(capacity) = self.capacity.filter(|&capacity| jobs.len() >= capacity) {
                return Err(QueueError::Full { capacity });
            }
            jobs.push_back(job);
            Ok(())
        }

        fn depth(&self) -> usize {
            self.jobs.lock().len()
        }
    }

    impl RecordingScheduler {
        fn take(&self) -> Option<RetryJob> {
            self.jobs.lock().pop_front()
        }
    }

    fn receipt(status: &str) -> TransportReceipt {
        TransportReceipt {
            status: status.into(),
            id: Some("operation".into()),
            error: None,
        }
    }

    fn request() -> DeliveryRequest {
        DeliveryRequest::new(
            "Backup finished",
            Body::PlainText("ok".into()),
            "relay@example.com",
            AddressList::from_input("cron@host.example.com").unwrap(),
            Recipients {
                to: AddressList::from_input("a@example.com, b@example.com").unwrap(),
                ..Recipients::default()
            },
        )
        .unwrap()
    }

    fn manager(
        config: DeliveryConfig,
        transport: Arc<dyn Transport>,
        scheduler: Arc<RecordingScheduler>,
        clock: Arc<ManualClock>,
    ) -> DeliveryManager {
        DeliveryManager::new(config, transport, scheduler, clock)
    }

    /// Run queued jobs until the scheduler is empty, returning every outcome.
    async fn drain(manager: &DeliveryManager, scheduler: &RecordingScheduler) -> Vec<AttemptOutcome> {
        let mut outcomes = Vec::new();
        while let Some(job) = scheduler.take() {
            outcomes.push(manager.attempt(job).await);
        }
        outcomes
    }

    #[tokio::test]
    async fn success_logs_one_ok_entry() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let transport = ScriptedTransport::new(vec![Ok(receipt("Succeeded"))]);
        let manager = manager(
            DeliveryConfig::default(),
            transport.clone(),
            scheduler.clone(),
            Arc::new(ManualClock::default()),
        );

        manager.submit(request()).unwrap();
        assert_eq!(manager.queue_depth(), 1);

        let outcomes = drain(&manager, &scheduler).await;
        assert_eq!(outcomes, vec![AttemptOutcome::Succeeded]);

        let entries = manager.audit_log_snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, AuditStatus::Ok);
        assert_eq!(entries[0].transport_result, Some(receipt("Succeeded")));
        assert_eq!(entries[0].remaining_attempts, 3);
        assert_eq!(
            entries[0].to.to.addresses().collect::<Vec<_>>(),
            vec!["a@example.com", "b@example.com"]
        );
        assert_eq!(entries[0].from.first_address(), Ok("cron@host.example.com"));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn always_failing_transport_exhausts_the_budget() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let transport = ScriptedTransport::new(vec![Err(TransportError::Connection(
            "connection refused".into(),
        ))]);
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap(),
        ));
        let config = DeliveryConfig {
            retry: RetryPolicy {
                message_retry: 3,
                message_retry_delay: 600,
            },
            ..DeliveryConfig::default()
        };
        let manager = manager(config, transport.clone(), scheduler.clone(), clock.clone());

        manager.submit(request()).unwrap();

        let first = scheduler.take().unwrap();
        assert_eq!(manager.attempt(first).await, AttemptOutcome::Requeued);

        let requeued = scheduler.jobs.lock().front().cloned().unwrap();
        assert_eq!(requeued.remaining_attempts, 2);
        assert_eq!(requeued.not_before, clock.now() + TimeDelta::seconds(600));

        let outcomes = drain(&manager, &scheduler).await;
        assert_eq!(
            outcomes,
            vec![
                AttemptOutcome::Requeued,
                AttemptOutcome::Requeued,
                AttemptOutcome::Failed,
            ]
        );

        let statuses: Vec<_> = manager
            .audit_log_snapshot()
            .into_iter()
            .map(|entry| (entry.status, entry.remaining_attempts))
            .collect();
        assert_eq!(
            statuses,
            vec![
                (AuditStatus::Requeue, 3),
                (AuditStatus::Requeue, 2),
                (AuditStatus::Requeue, 1),
                (AuditStatus::Failed, 0),
            ]
        );
        assert_eq!(manager.queue_depth(), 0);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn remote_failure_status_is_retried() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let transport = ScriptedTransport::new(vec![
            Ok(TransportReceipt {
                status: "Failed".into(),
                id: Some("op".into()),
                error: Some("InvalidRecipient".into()),
            }),
            Ok(receipt("succeeded")),
        ]);
        let manager = manager(
            DeliveryConfig::default(),
            transport,
            scheduler.clone(),
            Arc::new(ManualClock::default()),
        );

        manager.submit(request()).unwrap();
        let outcomes = drain(&manager, &scheduler).await;
        assert_eq!(
            outcomes,
            vec![AttemptOutcome::Requeued, AttemptOutcome::Succeeded]
        );

        let entries = manager.audit_log_snapshot();
        assert_eq!(entries[0].status, AuditStatus::Requeue);
        assert_eq!(entries[0].error.as_deref(), Some("InvalidRecipient"));
        assert_eq!(entries[1].status, AuditStatus::Ok);
    }

    #[tokio::test]
    async fn full_queue_on_requeue_is_terminal() {
        let scheduler = Arc::new(RecordingScheduler {
            capacity: Some(1),
            ..RecordingScheduler::default()
        });
        let transport = ScriptedTransport::new(vec![Err(TransportError::Rejected {
            code: 503,
            detail: "busy".into(),
        })]);
        let manager = manager(
            DeliveryConfig::default(),
            transport,
            scheduler.clone(),
            Arc::new(ManualClock::default()),
        );

        manager.submit(request()).unwrap();
        let job = scheduler.take().unwrap();
        manager.submit(request()).unwrap();

        assert_eq!(manager.attempt(job).await, AttemptOutcome::Failed);

        let entries = manager.audit_log_snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, AuditStatus::Failed);
        assert!(entries[0].error.as_deref().unwrap().contains("queue is full"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_transport_times_out() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let config = DeliveryConfig {
            retry: RetryPolicy {
                message_retry: 0,
                message_retry_delay: 0,
            },
            send_timeout: 5,
            ..DeliveryConfig::default()
        };
        let manager = manager(
            config,
            Arc::new(StalledTransport),
            scheduler.clone(),
            Arc::new(ManualClock::default()),
        );

        manager.submit(request()).unwrap();
        let outcomes = drain(&manager, &scheduler).await;
        assert_eq!(outcomes, vec![AttemptOutcome::Failed]);
        assert_eq!(
            manager.audit_log_snapshot()[0].error.as_deref(),
            Some("Timed out after 5s")
        );
    }

    #[tokio::test]
    async fn old_entries_are_pruned_after_each_attempt() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let config = DeliveryConfig {
            retain_log_days: 1,
            ..DeliveryConfig::default()
        };
        let manager = manager(
            config,
            ScriptedTransport::new(vec![Ok(receipt("Succeeded"))]),
            scheduler.clone(),
            clock.clone(),
        );

        manager.submit(request()).unwrap();
        drain(&manager, &scheduler).await;

        clock.advance(TimeDelta::hours(12));
        manager.submit(request()).unwrap();
        drain(&manager, &scheduler).await;
        assert_eq!(manager.audit_log_snapshot().len(), 2);

        clock.advance(TimeDelta::hours(13));
        manager.submit(request()).unwrap();
        drain(&manager, &scheduler).await;

        let times: Vec<_> = manager
            .audit_log_snapshot()
            .into_iter()
            .map(|entry| entry.time)
            .collect();
        assert_eq!(times, vec![clock.now() - TimeDelta::hours(13), clock.now()]);
    }

    #[tokio::test]
    async fn disabled_log_keeps_delivery_behaviour() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Connection("reset".into())),
            Ok(receipt("Succeeded")),
        ]);
        let config = DeliveryConfig {
            enable_send_log: false,
            ..DeliveryConfig::default()
        };
        let manager = manager(
            config,
            transport.clone(),
            scheduler.clone(),
            Arc::new(ManualClock::default()),
        );

        manager.submit(request()).unwrap();
        let outcomes = drain(&manager, &scheduler).await;

        assert_eq!(
            outcomes,
            vec![AttemptOutcome::Requeued, AttemptOutcome::Succeeded]
        );
        assert!(manager.audit_log_snapshot().is_empty());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }
}
