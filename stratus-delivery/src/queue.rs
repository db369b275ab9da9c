//! Bounded in-memory delay queue.
//!
//! Jobs are ordered by their `not_before` instant, then by submission order,
//! and handed to a worker future once due. At most `parallelism` workers run
//! at the same time.

use std::{
    collections::BTreeMap,
    future::Future,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use stratus_common::{Signal, internal, tracing};
use tokio::{
    sync::{Notify, broadcast},
    task::JoinSet,
};

use crate::{clock::Clock, error::QueueError, types::RetryJob};

/// Upper bound on a single idle sleep, so clock adjustments are noticed.
const MAX_IDLE: Duration = Duration::from_secs(60);

/// Anything that accepts retry jobs for later execution.
pub trait Scheduler: Send + Sync {
    /// Queue `job`, failing immediately if there is no room.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Full`] when the queue is at capacity.
    fn submit(&self, job: RetryJob) -> Result<(), QueueError>;

    /// Jobs waiting to run.
    fn depth(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of waiting jobs.
    ///
    /// Default: 100
    #[serde(default = "defaults::max_queue_length")]
    pub max_queue_length: usize,

    /// Seconds a job may wait in the queue before it is discarded.
    ///
    /// Default: 43200 seconds (12 hours)
    #[serde(default = "defaults::send_queue_max_age")]
    pub send_queue_max_age: u64,

    /// Maximum number of jobs handled at once.
    ///
    /// Default: 1
    #[serde(default = "defaults::parallelism")]
    pub parallelism: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_length: defaults::max_queue_length(),
            send_queue_max_age: defaults::send_queue_max_age(),
            parallelism: defaults::parallelism(),
        }
    }
}

mod defaults {
    pub const fn max_queue_length() -> usize {
        100
    }

    pub const fn send_queue_max_age() -> u64 {
        43200
    }

    pub const fn parallelism() -> usize {
        1
    }
}

#[derive(Default)]
struct Pending {
    jobs: BTreeMap<(DateTime<Utc>, u64), RetryJob>,
    sequence: u64,
}

pub struct DelayQueue {
    pending: Mutex<Pending>,
    wakeup: Notify,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
}

impl DelayQueue {
    pub fn new(config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            pending: Mutex::new(Pending::default()),
            wakeup: Notify::new(),
            config,
            clock,
        }
    }

    pub const fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn max_age(&self) -> TimeDelta {
        TimeDelta::seconds(i64::try_from(self.config.send_queue_max_age).unwrap_or(i64::MAX))
    }

    /// Remove the earliest job if it is due.
    fn pop_due(&self, now: DateTime<Utc>) -> Option<RetryJob> {
        let mut pending = self.pending.lock();
        let entry = pending.jobs.first_entry()?;

        if entry.key().0 <= now {
            Some(entry.remove())
        } else {
            None
        }
    }

    /// How long until the earliest job is due, if there is one.
    fn until_next(&self, now: DateTime<Utc>) -> Option<Duration> {
        let pending = self.pending.lock();
        let (&(due, _), _) = pending.jobs.first_key_value()?;

        Some((due - now).to_std().unwrap_or(Duration::ZERO).min(MAX_IDLE))
    }

    fn is_stale(&self, job: &RetryJob, now: DateTime<Utc>) -> bool {
        now - job.submitted_at > self.max_age()
    }

    /// Hand due jobs to `worker` until `shutdown` fires.
    ///
    /// Jobs that waited longer than the configured maximum age are dropped
    /// instead of run. Workers still running at shutdown are awaited.
    #[tracing::instrument(level = tracing::Level::DEBUG, skip_all, fields(parallelism = self.config.parallelism))]
    pub async fn run<W, F>(&self, worker: W, mut shutdown: broadcast::Receiver<Signal>)
    where
        W: Fn(RetryJob) -> F + Send + Sync,
        F: Future<Output = ()> + Send + 'static,
    {
        internal!(level = DEBUG, "Send queue running");

        let parallelism = self.config.parallelism.max(1);
        let mut workers = JoinSet::new();

        loop {
            while workers.len() < parallelism {
                let now = self.clock.now();
                let Some(job) = self.pop_due(now) else {
                    break;
                };

                if self.is_stale(&job, now) {
                    tracing::error!(
                        subject = job.request.subject(),
                        submitted_at = %job.submitted_at,
                        remaining_attempts = job.remaining_attempts,
                        "Discarding message that waited too long in the send queue"
                    );
                    continue;
                }

                workers.spawn(worker(job));
            }

            let idle = if workers.len() < parallelism {
                self.until_next(self.clock.now())
            } else {
                None
            };

            tokio::select! {
                signal = shutdown.recv() => {
                    if matches!(signal, Ok(Signal::Shutdown | Signal::Finalised) | Err(broadcast::error::RecvError::Closed)) {
                        internal!(level = DEBUG, "Send queue received shutdown signal");
                        break;
                    }
                }

                Some(finished) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(err) = finished {
                        tracing::error!("Send worker failed: {err}");
                    }
                }

                () = self.wakeup.notified() => {}

                () = tokio::time::sleep(idle.unwrap_or(MAX_IDLE)), if idle.is_some() => {}
            }
        }

        while let Some(finished) = workers.join_next().await {
            if let Err(err) = finished {
                tracing::error!("Send worker failed: {err}");
            }
        }

        internal!(level = DEBUG, "Send queue stopped with {} jobs waiting", self.depth());
    }
}

impl Scheduler for DelayQueue {
    fn submit(&self, job: RetryJob) -> Result<(), QueueError> {
        {
            let mut pending = self.pending.lock();
            if pending.jobs.len() >= self.config.max_queue_length {
                return Err(QueueError::Full {
                    capacity: self.config.max_queue_length,
                });
            }

            let sequence = pending.sequence;
            pending.sequence += 1;
            pending.jobs.insert((job.not_before, sequence), job);
        }

        self.wakeup.notify_one();
        Ok(())
    }

    fn depth(&self) -> usize {
        self.pending.lock().jobs.len()
    }
}
