//! Storage gateway
//!
//! The rest of the service only sees [`ObjectStore`]: open a new object for
//! writing, open the newest object with a given name for reading, and list
//! stored names. Each upload creates a fresh object, so writers never share
//! an object and no locking is needed above this layer.

pub mod memory;
pub mod s3;

#[cfg(test)]
pub(crate) mod fake_s3;

use crate::config::{StorageBackend, StorageConfig};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::info;
use uuid::Uuid;

pub use memory::MemoryObjectStore;
pub use s3::S3ObjectStore;

/// Errors surfaced by object store backends
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Object store unavailable: {0}")]
    Unavailable(String),
}

/// Metadata attached to every stored object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMetadata {
    /// Identifier the uploading client sent in its header (may be empty)
    pub client_id: String,
}

/// Filter applied when listing objects; the default matches everything
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub client_id: Option<String>,
}

impl ListFilter {
    pub fn matches(&self, metadata: &ObjectMetadata) -> bool {
        self.client_id
            .as_deref()
            .map_or(true, |client_id| client_id == metadata.client_id)
    }
}

/// One entry produced by [`ObjectStore::list`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub name: String,
}

/// Summary of an object once its write target has been closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Backend-specific unique identifier
    pub id: String,
    /// Name the object is retrievable by
    pub name: String,
    /// Bytes written
    pub size_bytes: u64,
}

/// Sequential reader over a stored object's content
pub type ReadSource = Pin<Box<dyn AsyncRead + Send>>;

/// Lazy, one-shot listing of stored objects
pub type ObjectStream = BoxStream<'static, Result<ObjectEntry, StoreError>>;

/// Append-only sink for a new object.
///
/// `close` must be called on every path, including after a failed `write`;
/// whatever was written up to that point is kept.
#[async_trait]
pub trait WriteTarget: Send {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), StoreError>;

    async fn close(self: Box<Self>) -> Result<StoredObject, StoreError>;
}

/// Durable blob store used by both the ingest and HTTP sides.
///
/// Implementations must be safe for many concurrent readers and writers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Open a new, uniquely identified object for writing
    async fn begin_write(
        &self,
        name: &str,
        metadata: ObjectMetadata,
    ) -> Result<Box<dyn WriteTarget>, StoreError>;

    /// Open the most recently written object called `name`
    async fn begin_read(&self, name: &str) -> Result<ReadSource, StoreError>;

    /// List stored objects matching `filter`; order is backend-defined
    async fn list(&self, filter: ListFilter) -> Result<ObjectStream, StoreError>;
}

/// Generate an object identifier that sorts by creation time
pub fn new_object_id() -> String {
    format!(
        "{}-{}",
        Utc::now().format("%Y%m%dT%H%M%S%6fZ"),
        Uuid::new_v4().simple()
    )
}

/// Build the configured object store
pub async fn from_config(config: &StorageConfig) -> Result<Arc<dyn ObjectStore>> {
    match config.backend {
        StorageBackend::Memory => {
            info!("Using in-memory object store");
            Ok(Arc::new(MemoryObjectStore::new()))
        }
        StorageBackend::S3 => {
            let store = S3ObjectStore::new(&config.s3)
                .await
                .context("Failed to initialize S3 object store")?;
            Ok(Arc::new(store))
        }
    }
}
