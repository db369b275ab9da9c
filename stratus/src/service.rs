//! The assembled relay: SMTP engine, delivery queue and the watchdog that
//! keeps the engine alive.
//!
//! The engine sits behind a lock so the watchdog can replace it without
//! disturbing the queue; jobs already waiting for delivery survive a restart.

use std::{collections::VecDeque, net::SocketAddr, sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Mutex, RwLock};
use stratus_common::{
    AddressList, Body, DeliveryRequest, Recipients, Signal, internal, tracing,
};
use stratus_delivery::{
    AuditLogEntry, Clock, DelayQueue, DeliveryManager, HttpTransport, Scheduler, SystemClock,
    Transport,
};
use stratus_smtp::{EnvelopeParser, PolicyFilter, SmtpServer};
use tokio::{sync::broadcast, task::JoinHandle};

use crate::{config::Config, error::RelayError, handler::RelayHandler};

/// Subject of the report sent after the engine had to be restarted.
pub const RESTART_SUBJECT: &str = "STRATUS RELAY SERVICE FAILURE";

/// How long a freshly spawned engine gets to start accepting connections.
const ENGINE_STARTUP: Duration = Duration::from_secs(1);

/// Counts engine restarts over a rolling hour.
#[derive(Debug)]
pub struct RestartGuard {
    limit: u32,
    recent: VecDeque<DateTime<Utc>>,
    total: usize,
}

impl RestartGuard {
    pub const fn new(limit: u32) -> Self {
        Self {
            limit,
            recent: VecDeque::new(),
            total: 0,
        }
    }

    /// Note a restart at `now`, returning how many happened in the last hour.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::RestartStorm`] once the hourly limit is exceeded.
    pub fn record(&mut self, now: DateTime<Utc>) -> Result<usize, RelayError> {
        self.total += 1;
        self.recent.push_back(now);

        while self
            .recent
            .front()
            .is_some_and(|at| *at + TimeDelta::hours(1) <= now)
        {
            self.recent.pop_front();
        }

        let restarts = self.recent.len();
        if restarts > usize::try_from(self.limit).unwrap_or(usize::MAX) {
            return Err(RelayError::RestartStorm {
                restarts,
                limit: self.limit,
            });
        }

        Ok(restarts)
    }

    pub const fn total(&self) -> usize {
        self.total
    }
}

struct EngineHandle {
    server: Arc<SmtpServer>,
    stop: broadcast::Sender<Signal>,
    task: JoinHandle<std::io::Result<()>>,
}

impl EngineHandle {
    fn is_alive(&self) -> bool {
        self.server.is_serving() && !self.task.is_finished()
    }
}

pub struct RelayService {
    config: Config,
    policy: Arc<PolicyFilter>,
    parser: Arc<EnvelopeParser>,
    manager: Arc<DeliveryManager>,
    queue: Arc<DelayQueue>,
    engine: RwLock<Option<EngineHandle>>,
    restarts: Mutex<RestartGuard>,
    shutdown: broadcast::Sender<Signal>,
    clock: Arc<dyn Clock>,
}

impl RelayService {
    /// Build the relay around the HTTP transport described by `config`.
    ///
    /// # Errors
    ///
    /// Fails if the policy settings are invalid or the HTTP client cannot be
    /// created.
    pub fn from_config(config: Config) -> Result<Self, RelayError> {
        let transport = HttpTransport::new(config.transport.clone())?;
        Self::new(config, Arc::new(transport))
    }

    /// # Errors
    ///
    /// Fails if the policy settings are invalid.
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Result<Self, RelayError> {
        Self::with_clock(config, transport, Arc::new(SystemClock))
    }

    /// # Errors
    ///
    /// Fails if the policy settings are invalid.
    pub fn with_clock(
        config: Config,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RelayError> {
        let policy = Arc::new(PolicyFilter::new(config.policy()?));
        let parser = Arc::new(EnvelopeParser::new(
            config.relay.from_address.trim(),
            config.relay.move_from_replyto,
        ));

        let queue = Arc::new(DelayQueue::new(config.relay.queue, Arc::clone(&clock)));
        let scheduler: Arc<dyn Scheduler> = Arc::<DelayQueue>::clone(&queue);
        let manager = Arc::new(DeliveryManager::new(
            config.relay.delivery,
            transport,
            scheduler,
            Arc::clone(&clock),
        ));

        let (shutdown, _) = broadcast::channel(16);
        let restarts = Mutex::new(RestartGuard::new(config.server.server_restart_per_hour));

        Ok(Self {
            config,
            policy,
            parser,
            manager,
            queue,
            engine: RwLock::new(None),
            restarts,
            shutdown,
            clock,
        })
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Whether the SMTP engine is accepting connections.
    pub fn is_healthy(&self) -> bool {
        self.engine.read().as_ref().is_some_and(EngineHandle::is_alive)
    }

    /// Where the SMTP engine is listening, if it is running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.engine
            .read()
            .as_ref()
            .map(|engine| engine.server.local_addr())
    }

    pub fn queue_depth(&self) -> usize {
        self.manager.queue_depth()
    }

    pub fn audit_log_snapshot(&self) -> Vec<AuditLogEntry> {
        self.manager.audit_log_snapshot()
    }

    pub fn clear_log(&self) {
        self.manager.clear_log();
    }

    /// Engine restarts since the service was created.
    pub fn restart_count(&self) -> usize {
        self.restarts.lock().total()
    }

    /// Ask [`RelayService::run`] to stop.
    pub fn shutdown(&self) {
        if self.shutdown.send(Signal::Shutdown).is_err() {
            internal!(level = DEBUG, "Shutdown requested while the relay was not running");
        }
    }

    /// Stop the SMTP engine but leave the service running, so the watchdog
    /// brings it back.
    pub fn halt_engine(&self) {
        let stop = self.engine.read().as_ref().map(|engine| engine.stop.clone());
        if let Some(stop) = stop
            && stop.send(Signal::Shutdown).is_err()
        {
            internal!(level = DEBUG, "SMTP engine already stopped");
        }
    }

    async fn start_engine(&self) -> Result<(), RelayError> {
        let hooks = Arc::new(RelayHandler::new(
            Arc::clone(&self.policy),
            Arc::clone(&self.parser),
            Arc::clone(&self.manager),
        ));

        let server = Arc::new(
            SmtpServer::bind(
                self.config.listen_addr()?,
                hooks,
                self.config.server.session_config(),
            )
            .await?,
        );

        let (stop, receiver) = broadcast::channel(1);
        let task = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.serve(receiver).await }
        });

        let started = tokio::time::timeout(ENGINE_STARTUP, async {
            while !server.is_serving() && !task.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        if started.is_err() {
            tracing::warn!("SMTP engine on {} is slow to start", server.local_addr());
        }

        internal!(level = INFO, "SMTP engine listening on {}", server.local_addr());
        let previous = self
            .engine
            .write()
            .replace(EngineHandle { server, stop, task });

        if let Some(previous) = previous {
            previous.task.abort();
        }

        Ok(())
    }

    /// Stop the current engine, returning why it failed if it had.
    async fn stop_engine(&self) -> Option<String> {
        let engine = self.engine.write().take()?;
        if engine.stop.send(Signal::Shutdown).is_err() {
            internal!(level = DEBUG, "SMTP engine had already stopped");
        }

        match engine.task.await {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(err) => Some(err.to_string()),
        }
    }

    /// Run the relay until [`RelayService::shutdown`] is called.
    ///
    /// # Errors
    ///
    /// Fails if the SMTP engine cannot be started, or with
    /// [`RelayError::RestartStorm`] if it has to be restarted too often.
    #[tracing::instrument(level = tracing::Level::DEBUG, skip_all, err)]
    pub async fn run(&self) -> Result<(), RelayError> {
        let mut shutdown = self.shutdown.subscribe();
        self.start_engine().await?;

        let queue = tokio::spawn({
            let queue = Arc::clone(&self.queue);
            let manager = Arc::clone(&self.manager);
            let receiver = self.shutdown.subscribe();

            async move {
                queue
                    .run(
                        move |job| {
                            let manager = Arc::clone(&manager);
                            async move {
                                manager.attempt(job).await;
                            }
                        },
                        receiver,
                    )
                    .await;
            }
        });

        internal!(level = INFO, "Relay running");
        let result = self.supervise(&mut shutdown).await;

        internal!(level = INFO, "Relay shutting down ...");
        if let Some(err) = self.stop_engine().await {
            tracing::warn!("SMTP engine stopped with error: {err}");
        }
        if self.shutdown.send(Signal::Shutdown).is_err() {
            internal!(level = DEBUG, "Send queue already stopped");
        }
        if let Err(err) = queue.await {
            tracing::error!("Send queue task failed: {err}");
        }

        result
    }

    async fn supervise(&self, shutdown: &mut broadcast::Receiver<Signal>) -> Result<(), RelayError> {
        let mut watchdog = tokio::time::interval(self.config.server.watchdog_interval());
        watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        watchdog.tick().await;

        loop {
            tokio::select! {
                signal = shutdown.recv() => {
                    if stop_requested(&signal) {
                        return Ok(());
                    }
                }

                _ = watchdog.tick() => {
                    if !self.is_healthy() && !self.restart(shutdown).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Restart the SMTP engine after the configured delay. Returns `false`
    /// if shutdown was requested while waiting.
    async fn restart(&self, shutdown: &mut broadcast::Receiver<Signal>) -> Result<bool, RelayError> {
        let failed_at = self.clock.now();
        let error = self
            .stop_engine()
            .await
            .unwrap_or_else(|| String::from("SMTP engine is not serving"));

        let restarts = self.restarts.lock().record(failed_at).inspect_err(|err| {
            tracing::error!("SMTP engine failed ({error}): {err}");
        })?;

        let delay = self.config.server.restart_delay();
        tracing::error!(
            restarts,
            "SMTP engine stopped unexpectedly ({error}), restarting in {}s",
            delay.as_secs()
        );
        let pause = tokio::time::sleep(delay);
        tokio::pin!(pause);
        loop {
            tokio::select! {
                () = &mut pause => break,

                signal = shutdown.recv() => {
                    if stop_requested(&signal) {
                        internal!(level = INFO, "Shutdown requested, abandoning SMTP engine restart");
                        return Ok(false);
                    }
                }
            }
        }

        if let Err(err) = self.start_engine().await {
            tracing::error!("Failed to restart SMTP engine: {err}");
            return Ok(true);
        }

        self.report_restart(failed_at, &error);
        Ok(true)
    }

    fn report_restart(&self, failed_at: DateTime<Utc>, error: &str) {
        let Some(recipient) = self.config.server.server_restart_email.as_deref() else {
            return;
        };

        let report = AddressList::from_input(recipient)
            .map_err(|err| err.to_string())
            .and_then(|to| {
                DeliveryRequest::new(
                    RESTART_SUBJECT,
                    Body::PlainText(format!(
                        "Relay service failed at {failed_at}, error {error}"
                    )),
                    self.config.relay.from_address.trim(),
                    AddressList::new(),
                    Recipients {
                        to,
                        ..Recipients::default()
                    },
                )
                .map_err(|err| err.to_string())
            });

        match report.and_then(|request| self.manager.submit(request).map_err(|err| err.to_string())) {
            Ok(()) => internal!(level = INFO, "Queued restart report for {recipient}"),
            Err(err) => tracing::error!(
                "Unable to send restart report to {recipient}: {err}. Original failure at {failed_at}: {error}"
            ),
        }
    }
}

fn stop_requested(signal: &Result<Signal, broadcast::error::RecvError>) -> bool {
    matches!(
        signal,
        Ok(Signal::Shutdown | Signal::Finalised) | Err(broadcast::error::RecvError::Closed)
    )
}
