//! Ingest session: one accepted connection, one decoded header, one stored object.
//!
//! ```text
//! Decoding ──▶ Streaming ──▶ Closed
//!    │             │
//!    └─────────────┴──▶ Closed (failed)
//! ```
//!
//! The connection is shut down on every exit path. A failure while copying
//! still closes the write target, so whatever arrived before the failure is
//! left in the store as a partial object.

use crate::config::IngestConfig;
use crate::frame::{FrameDecoder, FrameError, UploadFrame};
use crate::storage::{ObjectMetadata, ObjectStore, StoreError, StoredObject, WriteTarget};
use metrics::{counter, histogram};
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant as TokioInstant;
use tracing::{debug, info, warn};

/// Errors that end an ingest session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Malformed upload header: {0}")]
    Frame(#[from] FrameError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Transport error: {0}")]
    Transport(#[source] io::Error),
}

impl SessionError {
    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Frame(_) => "frame",
            SessionError::Store(_) => "store",
            SessionError::Transport(_) => "transport",
        }
    }
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Decoding,
    Streaming,
    Closed,
}

/// Outcome of a successful session
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub name: String,
    pub client_id: String,
    pub object: StoredObject,
    pub bytes_received: u64,
    pub elapsed: Duration,
}

/// Handles a single ingestion connection from header to close.
pub struct IngestSession {
    store: Arc<dyn ObjectStore>,
    decoder: FrameDecoder,
    buffer_size: usize,
    idle_timeout: Option<Duration>,
    session_timeout: Option<Duration>,
    deadline: Option<TokioInstant>,
    state: SessionState,
}

impl IngestSession {
    pub fn new(store: Arc<dyn ObjectStore>, config: &IngestConfig) -> Self {
        Self {
            store,
            decoder: FrameDecoder::new(config.frame_layout, config.max_client_id_len),
            buffer_size: config.copy_buffer_bytes.max(1),
            idle_timeout: config.idle_timeout(),
            session_timeout: config.session_timeout(),
            deadline: None,
            state: SessionState::Decoding,
        }
    }

    /// Run the session to completion, consuming it and the connection.
    pub async fn run<S>(mut self, mut conn: S) -> Result<IngestReport, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let started = Instant::now();
        self.deadline = self.session_timeout.map(|limit| TokioInstant::now() + limit);
        let result = self.ingest(&mut conn, started).await;

        self.transition(SessionState::Closed);
        if let Err(e) = conn.shutdown().await {
            debug!(error = %e, "Connection already closed");
        }

        match &result {
            Ok(report) => {
                counter!("filedrop_sessions_completed_total").increment(1);
                histogram!("filedrop_session_duration_seconds")
                    .record(report.elapsed.as_secs_f64());
            }
            Err(e) => {
                counter!("filedrop_sessions_failed_total", "reason" => e.kind()).increment(1);
                if let SessionError::Frame(frame_error) = e {
                    counter!("filedrop_frame_errors_total", "kind" => frame_error.kind())
                        .increment(1);
                }
            }
        }

        result
    }

    async fn ingest<S>(&mut self, conn: &mut S, started: Instant) -> Result<IngestReport, SessionError>
    where
        S: AsyncRead + Unpin + Send,
    {
        let frame = self.read_header(conn).await?;
        let name = frame.name_lossy().into_owned();
        let client_id = frame.client_id_lossy().into_owned();

        debug!(name = %name, client_id = %client_id, "Decoded upload header");

        let mut target = self
            .store
            .begin_write(
                &name,
                ObjectMetadata {
                    client_id: client_id.clone(),
                },
            )
            .await?;

        self.transition(SessionState::Streaming);

        let copied = self.copy_content(conn, target.as_mut()).await;
        let closed = target.close().await;

        let (bytes_received, object) = match (copied, closed) {
            (Ok(bytes), Ok(object)) => (bytes, object),
            (Ok(_), Err(e)) => return Err(e.into()),
            (Err(e), closed) => {
                match closed {
                    Ok(object) => warn!(
                        object_id = %object.id,
                        size_bytes = object.size_bytes,
                        "Partial object left in store"
                    ),
                    Err(close_error) => warn!(
                        error = %close_error,
                        "Failed to close write target after copy failure"
                    ),
                }
                return Err(e);
            }
        };

        Ok(IngestReport {
            name,
            client_id,
            object,
            bytes_received,
            elapsed: started.elapsed(),
        })
    }

    async fn read_header<S>(&self, conn: &mut S) -> Result<UploadFrame, SessionError>
    where
        S: AsyncRead + Unpin + Send,
    {
        let decoded = self.timed(self.decoder.decode(conn)).await;
        match decoded {
            Ok(frame) => Ok(frame?),
            Err(elapsed) => Err(SessionError::Transport(elapsed)),
        }
    }

    /// Copy everything after the header into `target` through one reused buffer
    async fn copy_content<S>(
        &self,
        conn: &mut S,
        target: &mut dyn WriteTarget,
    ) -> Result<u64, SessionError>
    where
        S: AsyncRead + Unpin + Send,
    {
        let mut buf = vec![0u8; self.buffer_size];
        let mut total = 0u64;

        loop {
            let n = match self.timed(conn.read(&mut buf)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) | Err(e) => return Err(SessionError::Transport(e)),
            };
            if n == 0 {
                break;
            }

            target.write(&buf[..n]).await?;
            total += n as u64;
            counter!("filedrop_ingest_bytes_total").increment(n as u64);
        }

        Ok(total)
    }

    /// Await one read, bounded by the idle timeout and by what is left of
    /// the session deadline, whichever is shorter
    async fn timed<F, T>(&self, fut: F) -> Result<T, io::Error>
    where
        F: Future<Output = T>,
    {
        let remaining = self
            .deadline
            .map(|deadline| deadline.saturating_duration_since(TokioInstant::now()));

        let (limit, session_bound) = match (self.idle_timeout, remaining) {
            (None, None) => return Ok(fut.await),
            (_, Some(left)) if left.is_zero() => return Err(self.session_expired()),
            (Some(idle), Some(left)) if left < idle => (left, true),
            (Some(idle), _) => (idle, false),
            (None, Some(left)) => (left, true),
        };

        tokio::time::timeout(limit, fut).await.map_err(|_| {
            if session_bound {
                self.session_expired()
            } else {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no data received for {:?}", limit),
                )
            }
        })
    }

    fn session_expired(&self) -> io::Error {
        io::Error::new(
            io::ErrorKind::TimedOut,
            format!(
                "session exceeded {:?}",
                self.session_timeout.unwrap_or_default()
            ),
        )
    }

    fn transition(&mut self, next: SessionState) {
        debug!(from = ?self.state, to = ?next, "Session state change");
        self.state = next;
    }
}

/// Log the outcome of a finished session
pub fn log_outcome(result: &Result<IngestReport, SessionError>) {
    match result {
        Ok(report) => info!(
            name = %report.name,
            client_id = %report.client_id,
            object_id = %report.object.id,
            bytes = report.bytes_received,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Upload stored"
        ),
        Err(SessionError::Frame(e)) => warn!(error = %e, "Rejected upload header"),
        Err(e) => warn!(error = %e, "Upload failed"),
    }
}
