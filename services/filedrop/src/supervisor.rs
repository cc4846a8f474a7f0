//! Process supervisor.
//!
//! Runs the ingest acceptor and the HTTP gateway side by side over one shared
//! object store, then coordinates shutdown: both listeners stop on the first
//! signal, and in-flight sessions are waited for only as long as
//! `shutdown.drain_timeout_secs` allows.

use crate::acceptor::Acceptor;
use crate::config::Config;
use crate::http::{self, auth::Credentials, AppState};
use crate::storage::ObjectStore;
use anyhow::{anyhow, Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Both listeners, bound and ready to run
pub struct Supervisor {
    acceptor: Acceptor,
    http_listener: TcpListener,
    http_state: AppState,
    drain_timeout: Option<Duration>,
    shutdown: CancellationToken,
}

impl Supervisor {
    /// Bind the ingest and HTTP listeners
    pub async fn bind(config: &Config, store: Arc<dyn ObjectStore>) -> Result<Self> {
        let acceptor = Acceptor::bind(&config.ingest, store.clone()).await?;

        let http_addr = config.http_addr();
        let http_listener = TcpListener::bind(&http_addr)
            .await
            .with_context(|| format!("Failed to bind HTTP listener on {}", http_addr))?;

        let http_state = AppState::new(
            store,
            Credentials::new(config.http.username.clone(), config.http.password.clone()),
            config.session_ttl(),
        );

        Ok(Self {
            acceptor,
            http_listener,
            http_state,
            drain_timeout: config.drain_timeout(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn ingest_addr(&self) -> Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    pub fn http_addr(&self) -> Result<SocketAddr> {
        self.http_listener
            .local_addr()
            .context("Failed to read HTTP listener address")
    }

    /// Token that stops the service when cancelled, same as `signal` firing
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve until `signal` completes or the shutdown token is cancelled
    pub async fn run<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Supervisor {
            acceptor,
            http_listener,
            http_state,
            drain_timeout,
            shutdown,
        } = self;

        let sessions = acceptor.sessions();
        let mut acceptor_handle = tokio::spawn(acceptor.serve(shutdown.clone()));
        let mut http_handle = tokio::spawn(http::serve(http_listener, http_state, shutdown.clone()));

        info!("Filedrop started");

        let mut acceptor_running = true;
        let mut failure: Option<anyhow::Error> = None;
        let mut http_outcome: Option<Result<()>> = None;

        tokio::select! {
            _ = signal => {
                info!("Initiating graceful shutdown");
            }
            _ = shutdown.cancelled() => {
                info!("Shutdown requested");
            }
            joined = &mut acceptor_handle => {
                acceptor_running = false;
                warn!("Ingest acceptor exited unexpectedly");
                failure = Some(match joined {
                    Ok(()) => anyhow!("Ingest acceptor exited unexpectedly"),
                    Err(e) => anyhow!(e).context("Ingest acceptor task failed"),
                });
            }
            joined = &mut http_handle => {
                warn!("HTTP gateway exited unexpectedly");
                http_outcome = Some(match flatten(joined) {
                    Ok(()) => Err(anyhow!("HTTP gateway exited unexpectedly")),
                    Err(e) => Err(e),
                });
            }
        }

        // Stop both listeners
        shutdown.cancel();

        if acceptor_running {
            if let Err(e) = acceptor_handle.await {
                error!(error = %e, "Ingest acceptor task failed");
            }
        }
        sessions.close();

        let http_result = match drain_timeout {
            None => {
                info!(
                    active_sessions = sessions.len(),
                    "Listeners stopped; in-flight work is not awaited"
                );
                http_outcome.unwrap_or(Ok(()))
            }
            Some(limit) => {
                let drained = tokio::time::timeout(limit, async {
                    sessions.wait().await;
                    match http_outcome {
                        Some(outcome) => outcome,
                        None => flatten(http_handle.await),
                    }
                })
                .await;

                match drained {
                    Ok(result) => {
                        info!("In-flight work drained");
                        result
                    }
                    Err(_) => {
                        warn!(
                            active_sessions = sessions.len(),
                            timeout_secs = limit.as_secs(),
                            "Drain timeout elapsed with work still in flight"
                        );
                        Ok(())
                    }
                }
            }
        };

        if let Some(e) = failure {
            return Err(e);
        }
        http_result?;

        info!("Filedrop stopped");
        Ok(())
    }
}

fn flatten(joined: Result<Result<()>, JoinError>) -> Result<()> {
    joined.context("HTTP gateway task failed")?
}
