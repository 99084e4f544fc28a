//! In-memory storage, mainly for tests

use crate::error::{Error, Result};
use crate::storage::{object_path, ByteStream, StorageAdapter};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Keeps blobs in a map. All data is lost when dropped.
pub struct MemoryStorage {
    blobs: RwLock<HashMap<String, Bytes>>,
    prefix: String,
    chunk_size: usize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::with_chunk_size(4096)
    }

    /// Serve blobs back in pieces of `chunk_size` bytes
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        MemoryStorage {
            blobs: RwLock::new(HashMap::new()),
            prefix: crate::config::DEFAULT_STORAGE_PREFIX.to_string(),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Number of stored blobs
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    /// Raw stored bytes
    pub fn blob(&self, storage_path: &str) -> Option<Bytes> {
        self.blobs.read().get(storage_path).cloned()
    }

    /// Replace stored bytes directly
    pub fn set_blob(&self, storage_path: &str, data: impl Into<Bytes>) {
        self.blobs.write().insert(storage_path.to_string(), data.into());
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn put(&self, path_hint: &str, mut body: ByteStream) -> Result<String> {
        let mut data = BytesMut::new();
        while let Some(chunk) = body.next().await {
            data.extend_from_slice(&chunk?);
        }

        let storage_path = object_path(&self.prefix, path_hint);
        self.blobs.write().insert(storage_path.clone(), data.freeze());
        Ok(storage_path)
    }

    async fn get(&self, storage_path: &str) -> Result<ByteStream> {
        let data = self
            .blob(storage_path)
            .ok_or_else(|| Error::Storage(format!("blob not found: {}", storage_path)))?;

        let chunks: Vec<Result<Bytes>> = (0..data.len())
            .step_by(self.chunk_size)
            .map(|start| Ok(data.slice(start..(start + self.chunk_size).min(data.len()))))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }

    async fn delete(&self, storage_path: &str) -> Result<()> {
        self.blobs.write().remove(storage_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn test_roundtrip_in_chunks() {
        let storage = MemoryStorage::with_chunk_size(3);
        let body = stream::iter(vec![Ok(Bytes::from_static(b"0123456789"))]).boxed();
        let path = storage.put("a.txt", body).await.unwrap();

        let chunks: Vec<Bytes> = storage.get(&path).await.unwrap().try_collect().await.unwrap();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks.concat(), b"0123456789");
    }

    #[tokio::test]
    async fn test_failed_body_not_stored() {
        let storage = MemoryStorage::new();
        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Err(Error::Storage("gone".into())),
        ])
        .boxed();

        assert!(storage.put("a.txt", body).await.is_err());
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_missing_blob() {
        let storage = MemoryStorage::new();
        assert!(matches!(storage.get("encrypted/nope").await, Err(Error::Storage(_))));
        storage.delete("encrypted/nope").await.unwrap();
    }
}
