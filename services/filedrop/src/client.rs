//! Upload client for the ingestion protocol.
//!
//! Used by the test suite and by tooling that pushes files into a running
//! service. The server sends nothing back; waiting for it to close the
//! connection tells the sender that the object has been finalized.

use crate::config::FrameLayout;
use crate::frame::{encode_header, FrameError};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Invalid upload header: {0}")]
    Frame(#[from] FrameError),

    #[error("Upload I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Stream `content` to the ingestion listener at `addr` under `name`.
///
/// Returns the number of content bytes sent once the server has closed the
/// connection.
#[instrument(skip_all, fields(name = %String::from_utf8_lossy(name)))]
pub async fn upload<A, R>(
    addr: A,
    layout: FrameLayout,
    name: &[u8],
    client_id: &[u8],
    mut content: R,
) -> Result<u64, ClientError>
where
    A: ToSocketAddrs,
    R: AsyncRead + Unpin,
{
    let header = encode_header(layout, name, client_id)?;

    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(&header).await?;
    let sent = tokio::io::copy(&mut content, &mut stream).await?;
    stream.shutdown().await?;

    // Server never replies; EOF means the session is over
    let mut drain = [0u8; 64];
    while stream.read(&mut drain).await? > 0 {}

    debug!(bytes = sent, "Upload finished");
    Ok(sent)
}
