//! In-process object store.
//!
//! Keeps every object in memory in creation order. Used by tests and for
//! running the service without an external store.

use super::{
    new_object_id, ListFilter, ObjectEntry, ObjectMetadata, ObjectStore, ObjectStream,
    ReadSource, StoreError, StoredObject, WriteTarget,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use std::io::Cursor;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
struct MemoryObject {
    name: String,
    metadata: ObjectMetadata,
    data: Bytes,
}

/// Object store backed by a shared in-memory vector
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<Vec<Arc<MemoryObject>>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Metadata of the newest object called `name`
    pub fn metadata(&self, name: &str) -> Option<ObjectMetadata> {
        self.latest(name).map(|object| object.metadata.clone())
    }

    fn latest(&self, name: &str) -> Option<Arc<MemoryObject>> {
        self.objects
            .read()
            .iter()
            .rev()
            .find(|object| object.name == name)
            .cloned()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn begin_write(
        &self,
        name: &str,
        metadata: ObjectMetadata,
    ) -> Result<Box<dyn WriteTarget>, StoreError> {
        Ok(Box::new(MemoryWriteTarget {
            objects: self.objects.clone(),
            id: new_object_id(),
            name: name.to_string(),
            metadata,
            buffer: BytesMut::new(),
        }))
    }

    async fn begin_read(&self, name: &str) -> Result<ReadSource, StoreError> {
        let object = self
            .latest(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        Ok(Box::pin(Cursor::new(object.data.clone())))
    }

    async fn list(&self, filter: ListFilter) -> Result<ObjectStream, StoreError> {
        let entries: Vec<_> = self
            .objects
            .read()
            .iter()
            .filter(|object| filter.matches(&object.metadata))
            .map(|object| {
                Ok(ObjectEntry {
                    name: object.name.clone(),
                })
            })
            .collect();
        Ok(stream::iter(entries).boxed())
    }
}

struct MemoryWriteTarget {
    objects: Arc<RwLock<Vec<Arc<MemoryObject>>>>,
    id: String,
    name: String,
    metadata: ObjectMetadata,
    buffer: BytesMut,
}

#[async_trait]
impl WriteTarget for MemoryWriteTarget {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), StoreError> {
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<StoredObject, StoreError> {
        let this = *self;
        let stored = StoredObject {
            id: this.id.clone(),
            name: this.name.clone(),
            size_bytes: this.buffer.len() as u64,
        };

        this.objects.write().push(Arc::new(MemoryObject {
            name: this.name,
            metadata: this.metadata,
            data: this.buffer.freeze(),
        }));

        debug!(object_id = %stored.id, name = %stored.name, "Stored object in memory");
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use tokio::io::AsyncReadExt;

    async fn put(store: &MemoryObjectStore, name: &str, client_id: &str, data: &[u8]) {
        let mut target = store
            .begin_write(
                name,
                ObjectMetadata {
                    client_id: client_id.to_string(),
                },
            )
            .await
            .unwrap();
        target.write(data).await.unwrap();
        target.close().await.unwrap();
    }

    async fn read_all(store: &MemoryObjectStore, name: &str) -> Vec<u8> {
        let mut reader = store.begin_read(name).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let store = MemoryObjectStore::new();
        put(&store, "frame9.png", "cam", b"\x01\x02\x03").await;

        assert_eq!(read_all(&store, "frame9.png").await, b"\x01\x02\x03");
        assert_eq!(store.metadata("frame9.png").unwrap().client_id, "cam");
    }

    #[tokio::test]
    async fn test_missing_object() {
        let store = MemoryObjectStore::new();
        let err = store.begin_read("nope").await.err().unwrap();
        assert!(matches!(err, StoreError::NotFound(name) if name == "nope"));
    }

    #[tokio::test]
    async fn test_object_not_visible_until_closed() {
        let store = MemoryObjectStore::new();
        let mut target = store
            .begin_write("pending", ObjectMetadata::default())
            .await
            .unwrap();
        target.write(b"abc").await.unwrap();
        assert!(store.is_empty());

        let stored = target.close().await.unwrap();
        assert_eq!(stored.size_bytes, 3);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_same_name_reads_newest() {
        let store = MemoryObjectStore::new();
        put(&store, "a.txt", "", b"old").await;
        put(&store, "a.txt", "", b"new").await;

        assert_eq!(store.len(), 2);
        assert_eq!(read_all(&store, "a.txt").await, b"new");
    }

    #[tokio::test]
    async fn test_list_with_filter() {
        let store = MemoryObjectStore::new();
        put(&store, "a", "cam-1", b"1").await;
        put(&store, "b", "cam-2", b"2").await;
        put(&store, "c", "cam-1", b"3").await;

        let all: Vec<ObjectEntry> = store
            .list(ListFilter::default())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(all.len(), 3);

        let names: Vec<String> = store
            .list(ListFilter {
                client_id: Some("cam-1".to_string()),
            })
            .await
            .unwrap()
            .map_ok(|entry| entry.name)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(names, vec!["a".to_string(), "c".to_string()]);
    }
}
