use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use stratus_common::{Signal, internal, tracing};
use tokio::{net::TcpListener, sync::broadcast, task::JoinSet};

use crate::{
    hooks::SmtpHooks,
    session::{Session, SessionConfig},
};

/// Clears the serving flag however the accept loop ends.
struct ServingGuard<'a>(&'a AtomicBool);

impl Drop for ServingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A TCP listener that runs one [`Session`] task per connection.
pub struct SmtpServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    hooks: Arc<dyn SmtpHooks>,
    config: Arc<SessionConfig>,
    serving: AtomicBool,
}

impl SmtpServer {
    /// Bind the listening socket. Connections queue until [`SmtpServer::serve`] runs.
    ///
    /// # Errors
    ///
    /// Fails if the address cannot be bound.
    pub async fn bind(
        address: SocketAddr,
        hooks: Arc<dyn SmtpHooks>,
        config: SessionConfig,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            hooks,
            config: Arc::new(config),
            serving: AtomicBool::new(false),
        })
    }

    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the accept loop is currently running.
    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::SeqCst)
    }

    /// Accept connections until `shutdown` fires or accepting fails.
    ///
    /// On shutdown, open sessions see the same signal and are awaited; if
    /// accepting fails they are aborted.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped the accept loop.
    #[tracing::instrument(level = tracing::Level::DEBUG, skip_all, fields(address = %self.local_addr), err)]
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<Signal>) -> io::Result<()> {
        self.serving.store(true, Ordering::SeqCst);
        let guard = ServingGuard(&self.serving);

        internal!(level = INFO, "Serving SMTP on {}", self.local_addr);
        let mut sessions = JoinSet::new();

        let result = loop {
            tokio::select! {
                signal = shutdown.recv() => {
                    if matches!(signal, Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed)) {
                        internal!(level = INFO, "SMTP Listener {} received shutdown signal, finishing sessions ...", self.local_addr);
                        break Ok(());
                    }
                }

                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(err) = finished {
                        internal!(level = ERROR, "Session task failed: {err}");
                    }
                }

                connection = self.listener.accept() => {
                    let (stream, peer) = match connection {
                        Ok(connection) => connection,
                        Err(err) => break Err(err),
                    };
                    tracing::debug!("Connection received on {} from {peer}", self.local_addr);

                    let session = Session::new(
                        stream,
                        peer,
                        Arc::clone(&self.hooks),
                        Arc::clone(&self.config),
                        shutdown.resubscribe(),
                    );
                    sessions.spawn(async move {
                        if let Err(err) = session.run().await {
                            internal!(level = DEBUG, "Session with {peer} ended: {err}");
                        }
                    });
                }
            }
        };

        drop(guard);
        if result.is_err() {
            sessions.abort_all();
        }
        while sessions.join_next().await.is_some() {}

        result
    }
}
