//! Upload header framing.
//!
//! Every ingestion connection starts with a length-prefixed header followed
//! by the raw file content. Content has no length and no trailer; it runs
//! until the sender closes its write side.
//!
//! ```text
//! +---------------+------------------+-------------------+---------------------+------------
//! | name_len (u32)| name             | client_id_len(u32)| client_id           | content ...
//! | big-endian    | name_len bytes   | big-endian        | client_id_len bytes | until EOF
//! +---------------+------------------+-------------------+---------------------+------------
//! ```
//!
//! Legacy senders omit both client id fields ([`FrameLayout::NameOnly`]).
//! The two layouts cannot be told apart on the wire, so the layout is a
//! listener setting rather than something the decoder infers.

use crate::config::FrameLayout;
use std::borrow::Cow;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Longest object name a frame may carry.
pub const MAX_NAME_LEN: u32 = 255;

/// Header field a decode error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameField {
    NameLength,
    Name,
    ClientIdLength,
    ClientId,
}

impl std::fmt::Display for FrameField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            FrameField::NameLength => "name length",
            FrameField::Name => "name",
            FrameField::ClientIdLength => "client id length",
            FrameField::ClientId => "client id",
        };
        f.write_str(label)
    }
}

/// Errors produced while decoding an upload header.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Invalid {field}: {len}")]
    InvalidLength { field: FrameField, len: u32 },

    #[error("Stream ended while reading {field}")]
    Truncated { field: FrameField },

    #[error("I/O error while reading {field}: {source}")]
    Io {
        field: FrameField,
        #[source]
        source: io::Error,
    },
}

impl FrameError {
    fn from_io(field: FrameField, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::UnexpectedEof {
            FrameError::Truncated { field }
        } else {
            FrameError::Io { field, source }
        }
    }

    /// Short label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            FrameError::InvalidLength { .. } => "invalid_length",
            FrameError::Truncated { .. } => "truncated",
            FrameError::Io { .. } => "io",
        }
    }
}

/// Decoded upload header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFrame {
    /// Object name bytes exactly as sent
    pub name: Vec<u8>,
    /// Client identifier bytes exactly as sent (empty when absent)
    pub client_id: Vec<u8>,
}

impl UploadFrame {
    /// Object name as text, invalid UTF-8 replaced
    pub fn name_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.name)
    }

    /// Client identifier as text, invalid UTF-8 replaced
    pub fn client_id_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.client_id)
    }
}

/// Reads upload headers off a byte stream.
#[derive(Debug, Clone, Copy)]
pub struct FrameDecoder {
    layout: FrameLayout,
    max_client_id_len: u32,
}

impl FrameDecoder {
    pub fn new(layout: FrameLayout, max_client_id_len: u32) -> Self {
        Self {
            layout,
            max_client_id_len,
        }
    }

    /// Decode one header from `reader`.
    ///
    /// Consumes exactly the header bytes; everything after them is left in
    /// the reader for the caller to treat as content.
    pub async fn decode<R>(&self, reader: &mut R) -> Result<UploadFrame, FrameError>
    where
        R: AsyncRead + Unpin,
    {
        let name_len = reader
            .read_u32()
            .await
            .map_err(|e| FrameError::from_io(FrameField::NameLength, e))?;

        if name_len == 0 || name_len > MAX_NAME_LEN {
            return Err(FrameError::InvalidLength {
                field: FrameField::NameLength,
                len: name_len,
            });
        }

        let name = read_bytes(reader, name_len, FrameField::Name).await?;

        let client_id = match self.layout {
            FrameLayout::NameOnly => Vec::new(),
            FrameLayout::NameAndClientId => match read_optional_u32(reader).await? {
                None => Vec::new(),
                Some(len) if len > self.max_client_id_len => {
                    return Err(FrameError::InvalidLength {
                        field: FrameField::ClientIdLength,
                        len,
                    });
                }
                Some(len) => read_bytes(reader, len, FrameField::ClientId).await?,
            },
        };

        Ok(UploadFrame { name, client_id })
    }
}

async fn read_bytes<R>(reader: &mut R, len: u32, field: FrameField) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; len as usize];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| FrameError::from_io(field, e))?;
    Ok(buf)
}

/// Read a big-endian u32, returning `None` on a clean EOF before its first byte.
async fn read_optional_u32<R>(reader: &mut R) -> Result<Option<u32>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let field = FrameField::ClientIdLength;
    let mut buf = [0u8; 4];
    let mut filled = 0;

    while filled < buf.len() {
        let n = reader
            .read(&mut buf[filled..])
            .await
            .map_err(|e| FrameError::from_io(field, e))?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FrameError::Truncated { field });
        }
        filled += n;
    }

    Ok(Some(u32::from_be_bytes(buf)))
}

/// Encode an upload header in the given layout.
///
/// `name` must be 1..=255 bytes; the client id is dropped for
/// [`FrameLayout::NameOnly`].
pub fn encode_header(
    layout: FrameLayout,
    name: &[u8],
    client_id: &[u8],
) -> Result<Vec<u8>, FrameError> {
    let name_len = u32::try_from(name.len()).unwrap_or(u32::MAX);
    if name_len == 0 || name_len > MAX_NAME_LEN {
        return Err(FrameError::InvalidLength {
            field: FrameField::NameLength,
            len: name_len,
        });
    }

    let mut out = Vec::with_capacity(8 + name.len() + client_id.len());
    out.extend_from_slice(&name_len.to_be_bytes());
    out.extend_from_slice(name);

    if layout == FrameLayout::NameAndClientId {
        let client_id_len =
            u32::try_from(client_id.len()).map_err(|_| FrameError::InvalidLength {
                field: FrameField::ClientIdLength,
                len: u32::MAX,
            })?;
        out.extend_from_slice(&client_id_len.to_be_bytes());
        out.extend_from_slice(client_id);
    }

    Ok(out)
}
