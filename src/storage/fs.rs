//! Local directory storage

use crate::error::{Error, Result};
use crate::storage::{object_path, read_stream, ByteStream, StorageAdapter};
use async_trait::async_trait;
use futures::StreamExt;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const PARTIAL_SUFFIX: &str = ".partial";

/// Stores envelopes as files below a root directory
///
/// Uploads land in a `.partial` file that is renamed into place only after
/// the whole body was written, so a failed upload never leaves a blob.
pub struct FsStorage {
    root: PathBuf,
    prefix: String,
    read_chunk_size: usize,
}

impl FsStorage {
    pub fn new<P: AsRef<Path>>(root: P, prefix: &str, read_chunk_size: usize) -> Self {
        FsStorage {
            root: root.as_ref().to_path_buf(),
            prefix: prefix.trim_matches('/').to_string(),
            read_chunk_size,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a storage path to a file below the root, rejecting escapes
    fn resolve(&self, storage_path: &str) -> Result<PathBuf> {
        let relative = Path::new(storage_path);
        let mut resolved = self.root.clone();
        let mut depth = 0;

        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                _ => return Err(Error::InvalidStoragePath(storage_path.to_string())),
            }
        }

        if depth == 0 {
            return Err(Error::InvalidStoragePath(storage_path.to_string()));
        }
        Ok(resolved)
    }

    async fn write_body(file: &mut File, mut body: ByteStream) -> Result<u64> {
        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }

    /// Write the body beside `target` and rename it into place. Nothing is
    /// left behind when writing or renaming fails.
    async fn store_at(target: &Path, body: ByteStream) -> Result<u64> {
        let mut partial = target.as_os_str().to_os_string();
        partial.push(PARTIAL_SUFFIX);
        let partial = PathBuf::from(partial);

        let mut file = File::create(&partial).await?;
        let result = Self::write_body(&mut file, body).await;
        drop(file);

        let result = match result {
            Ok(written) => fs::rename(&partial, target)
                .await
                .map(|()| written)
                .map_err(Error::from),
            Err(e) => Err(e),
        };

        if result.is_err() {
            if let Err(cleanup) = fs::remove_file(&partial).await {
                warn!("Failed to remove partial upload {}: {}", partial.display(), cleanup);
            }
        }
        result
    }
}

#[async_trait]
impl StorageAdapter for FsStorage {
    async fn put(&self, path_hint: &str, body: ByteStream) -> Result<String> {
        let storage_path = object_path(&self.prefix, path_hint);
        let target = self.resolve(&storage_path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        let written = Self::store_at(&target, body).await?;
        debug!("Stored {} ({} bytes)", storage_path, written);
        Ok(storage_path)
    }

    async fn get(&self, storage_path: &str) -> Result<ByteStream> {
        let path = self.resolve(storage_path)?;
        let file = File::open(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::Storage(format!("blob not found: {}", storage_path)),
            _ => Error::Io(e),
        })?;
        Ok(read_stream(file, self.read_chunk_size))
    }

    async fn delete(&self, storage_path: &str) -> Result<()> {
        let path = self.resolve(storage_path)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Deleted {}", storage_path);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("Blob {} already absent", storage_path);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
