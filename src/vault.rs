//! Document vault
//!
//! Upload: fresh data key, wrapped under the master key; the body is
//! stream-encrypted straight into storage and the record saved afterwards.
//! Download reverses it. Callers only ever see `DecryptionFailed` for a bad
//! envelope; the specific cause goes to the log.

use crate::config::{Config, DEFAULT_MAX_DOCUMENT_SIZE};
use crate::crypto::{
    decrypt_stream, encrypt_stream, open_legacy, DataKey, DataKeyFactory, KeyManager,
    MIN_ENVELOPE_SIZE,
};
use crate::error::{Error, Result};
use crate::metadata::{
    DocumentPage, DocumentRecord, EnvelopeFormat, MetadataStore, SledMetadataStore,
};
use crate::storage::{ByteStream, FsStorage, StorageAdapter};
use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Limits enforced by the vault
#[derive(Debug, Clone, Copy)]
pub struct VaultLimits {
    /// Largest accepted plaintext in bytes
    pub max_document_size: u64,
}

impl Default for VaultLimits {
    fn default() -> Self {
        VaultLimits {
            max_document_size: DEFAULT_MAX_DOCUMENT_SIZE,
        }
    }
}

/// Encrypted document storage service
pub struct DocumentVault {
    keys: Arc<KeyManager>,
    storage: Arc<dyn StorageAdapter>,
    metadata: Arc<dyn MetadataStore>,
    limits: VaultLimits,
}

impl DocumentVault {
    pub fn new(
        keys: Arc<KeyManager>,
        storage: Arc<dyn StorageAdapter>,
        metadata: Arc<dyn MetadataStore>,
        limits: VaultLimits,
    ) -> Self {
        DocumentVault {
            keys,
            storage,
            metadata,
            limits,
        }
    }

    /// Build a vault on local storage from configuration
    ///
    /// Fails unless the master keypair resolves and parses.
    pub fn open(config: &Config) -> Result<Self> {
        let keys = KeyManager::new(config.master_key_source()?);
        keys.load()?;

        config.ensure_directories()?;
        let storage = FsStorage::new(
            config.storage_root(),
            &config.storage.prefix,
            config.limits.read_chunk_size,
        );
        let metadata = SledMetadataStore::open(config.metadata_path())?;

        Ok(Self::new(
            Arc::new(keys),
            Arc::new(storage),
            Arc::new(metadata),
            VaultLimits {
                max_document_size: config.limits.max_document_size,
            },
        ))
    }

    pub fn keys(&self) -> &KeyManager {
        &self.keys
    }

    pub fn limits(&self) -> VaultLimits {
        self.limits
    }

    /// Encrypt and store a document
    ///
    /// The body is never buffered whole. A body larger than the configured
    /// limit, or one that fails mid-way, leaves neither blob nor record.
    pub async fn upload<S, E>(
        &self,
        file_name: &str,
        mime_type: &str,
        body: S,
    ) -> Result<DocumentRecord>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
        E: Into<Error> + Send + 'static,
    {
        let data_key = DataKeyFactory::generate();
        let wrapped_key = self.keys.wrap(data_key.as_bytes())?;

        let limit = self.limits.max_document_size;
        let received = Arc::new(AtomicU64::new(0));
        let counter = received.clone();
        let counted = body.map(move |chunk| {
            let chunk = chunk.map_err(Into::<Error>::into)?;
            let total = counter.fetch_add(chunk.len() as u64, Ordering::Relaxed) + chunk.len() as u64;
            if total > limit {
                return Err(Error::DocumentTooLarge { limit });
            }
            Ok(chunk)
        });

        let envelope = encrypt_stream(&data_key, counted).boxed();
        let storage_path = self.storage.put(file_name, envelope).await.map_err(|e| {
            warn!("Upload of {} aborted: {}", file_name, e);
            e
        })?;

        let size = received.load(Ordering::Relaxed);
        let record = DocumentRecord::new(
            storage_path,
            wrapped_key,
            file_name.to_string(),
            mime_type.to_string(),
            size,
        );

        if let Err(e) = self.metadata.save(&record) {
            error!("Failed to save record for {}: {}", record.storage_path, e);
            if let Err(cleanup) = self.storage.delete(&record.storage_path).await {
                error!("Orphaned blob {}: {}", record.storage_path, cleanup);
            }
            return Err(e);
        }

        info!("Stored document {} ({}, {} bytes)", record.id, record.file_name, size);
        Ok(record)
    }

    /// Look up a record
    pub fn get(&self, id: &Uuid) -> Result<DocumentRecord> {
        self.metadata
            .get(id)?
            .ok_or_else(|| Error::DocumentNotFound(id.to_string()))
    }

    /// Fetch a document and stream its plaintext
    ///
    /// The stream only ends without error after the envelope verified.
    /// Bytes it yielded before a failure must be discarded.
    pub async fn download(&self, id: &Uuid) -> Result<(DocumentRecord, ByteStream)> {
        let record = self.get(id)?;
        let data_key = self.keys.unwrap(&record.wrapped_key).map_err(|e| {
            error!("Data key for document {} did not unwrap: {}", id, e);
            e.public()
        })?;

        let envelope = self.storage.get(&record.storage_path).await?;
        let plaintext = match record.format {
            EnvelopeFormat::Streaming => decrypt_stream(&data_key, envelope).boxed(),
            EnvelopeFormat::Legacy => self.open_legacy_blob(&data_key, envelope).await?,
        };

        let id = record.id;
        let plaintext = plaintext
            .map(move |item| {
                item.map_err(|e| {
                    if e.is_decryption_failure() {
                        error!("Document {} failed to decrypt: {}", id, e);
                    }
                    e.public()
                })
            })
            .boxed();

        debug!("Streaming document {} ({:?} envelope)", id, record.format);
        Ok((record, plaintext))
    }

    /// Legacy records put the tag first, so the whole blob is needed up front
    async fn open_legacy_blob(&self, key: &DataKey, mut envelope: ByteStream) -> Result<ByteStream> {
        let cap = self.limits.max_document_size + MIN_ENVELOPE_SIZE as u64;
        let mut buf = BytesMut::new();
        while let Some(chunk) = envelope.next().await {
            buf.extend_from_slice(&chunk?);
            if buf.len() as u64 > cap {
                return Err(Error::DocumentTooLarge {
                    limit: self.limits.max_document_size,
                });
            }
        }

        let items = match open_legacy(key, &buf) {
            Ok(plaintext) if plaintext.is_empty() => Vec::new(),
            Ok(plaintext) => vec![Ok(Bytes::from(plaintext))],
            Err(e) => vec![Err(e)],
        };
        Ok(stream::iter(items).boxed())
    }

    /// Remove a document's blob and record
    pub async fn delete(&self, id: &Uuid) -> Result<DocumentRecord> {
        let record = self.get(id)?;
        self.storage.delete(&record.storage_path).await?;
        self.metadata.delete(id)?;
        info!("Deleted document {} ({})", id, record.file_name);
        Ok(record)
    }

    /// Page through documents, newest first
    pub fn list(&self, page: usize, limit: usize) -> Result<DocumentPage> {
        self.metadata.list(page, limit)
    }

    pub fn count(&self) -> Result<usize> {
        self.metadata.count()
    }
}
