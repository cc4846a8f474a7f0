//! TCP acceptor for the ingestion side.
//!
//! Every accepted connection gets its own [`IngestSession`] task. Sessions are
//! independent: a failing session is logged and never affects the listener or
//! its siblings.

use crate::config::IngestConfig;
use crate::session::{log_outcome, IngestSession};
use crate::storage::ObjectStore;
use anyhow::{Context, Result};
use metrics::{counter, gauge};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, info_span, warn, Instrument};

/// Pause after a failed `accept` so a persistent error does not spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Listens for upload connections and spawns a session for each one
pub struct Acceptor {
    listener: TcpListener,
    store: Arc<dyn ObjectStore>,
    config: IngestConfig,
    admission: Option<Arc<Semaphore>>,
    sessions: TaskTracker,
}

impl Acceptor {
    /// Bind the ingestion listener
    pub async fn bind(config: &IngestConfig, store: Arc<dyn ObjectStore>) -> Result<Self> {
        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind ingest listener on {}", addr))?;

        let admission = match config.max_concurrent_sessions {
            0 => None,
            limit => Some(Arc::new(Semaphore::new(limit))),
        };

        Ok(Self {
            listener,
            store,
            config: config.clone(),
            admission,
            sessions: TaskTracker::new(),
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read ingest listener address")
    }

    /// Tracker for spawned sessions, used to drain them on shutdown
    pub fn sessions(&self) -> TaskTracker {
        self.sessions.clone()
    }

    /// Accept connections until `shutdown` is cancelled.
    ///
    /// Returns once the listener is closed; sessions already running keep
    /// going and can be awaited through [`Acceptor::sessions`].
    pub async fn serve(self, shutdown: CancellationToken) {
        let local = self.listener.local_addr().ok();
        info!(address = ?local, "Ingest listener started");

        loop {
            let permit = match &self.admission {
                None => None,
                Some(admission) => tokio::select! {
                    _ = shutdown.cancelled() => break,
                    permit = admission.clone().acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                },
            };

            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        counter!("filedrop_accept_errors_total").increment(1);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            if let Err(e) = stream.set_nodelay(true) {
                warn!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
            }

            counter!("filedrop_sessions_accepted_total").increment(1);
            gauge!("filedrop_sessions_active").increment(1.0);

            let session = IngestSession::new(self.store.clone(), &self.config);
            self.sessions.spawn(
                async move {
                    let result = session.run(stream).await;
                    log_outcome(&result);
                    gauge!("filedrop_sessions_active").decrement(1.0);
                    drop(permit);
                }
                .instrument(info_span!("ingest_session", peer = %peer)),
            );
        }

        self.sessions.close();
        info!(active_sessions = self.sessions.len(), "Ingest listener stopped");
    }
}
