//! Envelope blob storage
//!
//! Storage only ever sees opaque envelopes and must return them byte-exact.
//! Blob paths follow `<prefix>/<uuid>_<file name>`.

mod fs;
mod memory;

pub use fs::FsStorage;
pub use memory::MemoryStorage;

use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

/// Boxed stream of byte chunks moving between the vault and storage
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Blob store consumed by the vault
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Store the body under a fresh path derived from `path_hint`.
    ///
    /// Returns the storage path. If the body stream fails, nothing is kept.
    async fn put(&self, path_hint: &str, body: ByteStream) -> Result<String>;

    /// Stream back a stored blob
    async fn get(&self, storage_path: &str) -> Result<ByteStream>;

    /// Remove a stored blob. Removing a missing blob is not an error.
    async fn delete(&self, storage_path: &str) -> Result<()>;
}

/// Reduce a user supplied file name to a single safe path component
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .take(128)
        .collect();

    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        "document".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Fresh storage path for a document
pub fn object_path(prefix: &str, file_name: &str) -> String {
    format!(
        "{}/{}_{}",
        prefix.trim_matches('/'),
        Uuid::new_v4(),
        sanitize_file_name(file_name)
    )
}

/// Stream an async reader in chunks of at most `chunk_size` bytes
pub fn read_stream<R>(reader: R, chunk_size: usize) -> ByteStream
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let chunk_size = chunk_size.max(1);
    stream::unfold(Some(reader), move |state| async move {
        let mut reader = state?;
        let mut buf = vec![0u8; chunk_size];
        match reader.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(Bytes::from(buf)), Some(reader)))
            }
            Err(e) => Some((Err(Error::from(e)), None)),
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("report.pdf"), "report.pdf");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\docs\\tax return.pdf"), "tax_return.pdf");
        assert_eq!(sanitize_file_name(".."), "document");
        assert_eq!(sanitize_file_name(""), "document");
        assert_eq!(sanitize_file_name(".hidden"), "hidden");
    }

    #[test]
    fn test_object_path_layout() {
        let path = object_path("encrypted", "scan 1.png");
        let (prefix, name) = path.split_once('/').unwrap();
        assert_eq!(prefix, "encrypted");

        let (id, rest) = name.split_at(36);
        assert!(Uuid::parse_str(id).is_ok());
        assert_eq!(rest, "_scan_1.png");

        assert_ne!(object_path("encrypted", "a"), object_path("encrypted", "a"));
    }

    #[tokio::test]
    async fn test_read_stream_chunks() {
        let data: Vec<u8> = (0..100u8).collect();
        let chunks: Vec<Bytes> = read_stream(std::io::Cursor::new(data.clone()), 30)
            .try_collect()
            .await
            .unwrap();

        assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= 30));
        assert_eq!(chunks.concat(), data);
    }
}
