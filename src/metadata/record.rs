//! Document record definitions

use crate::crypto::WrappedKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope layout of a stored blob
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvelopeFormat {
    /// `IV || ciphertext || tag`, written by the streaming encryptor
    #[default]
    Streaming,
    /// `IV || tag || ciphertext`, written by earlier buffered uploads
    Legacy,
}

/// Everything needed to find and decrypt one document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: Uuid,

    /// Location of the envelope in blob storage
    pub storage_path: String,

    /// Data key wrapped under the master public key
    pub wrapped_key: WrappedKey,

    pub file_name: String,

    pub mime_type: String,

    /// Plaintext size in bytes
    pub size: u64,

    #[serde(default)]
    pub format: EnvelopeFormat,

    pub created_at: DateTime<Utc>,
}

impl DocumentRecord {
    /// Create a record for a freshly stored streaming envelope
    pub fn new(
        storage_path: String,
        wrapped_key: WrappedKey,
        file_name: String,
        mime_type: String,
        size: u64,
    ) -> Self {
        DocumentRecord {
            id: Uuid::new_v4(),
            storage_path,
            wrapped_key,
            file_name,
            mime_type,
            size,
            format: EnvelopeFormat::Streaming,
            created_at: Utc::now(),
        }
    }
}

/// One page of records, newest first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentPage {
    pub documents: Vec<DocumentRecord>,
    /// 1-based page number
    pub page: usize,
    pub limit: usize,
    pub total: usize,
}

impl DocumentPage {
    pub fn total_pages(&self) -> usize {
        if self.limit == 0 {
            0
        } else {
            self.total.div_ceil(self.limit)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_serialization() {
        assert_eq!(serde_json::to_string(&EnvelopeFormat::Streaming).unwrap(), "\"streaming\"");
        assert_eq!(serde_json::to_string(&EnvelopeFormat::Legacy).unwrap(), "\"legacy\"");
    }

    #[test]
    fn test_record_without_format_is_streaming() {
        let json = r#"{
            "id": "6f1c2a4e-8d3b-4f6a-9c1e-2b7d5a0e3f41",
            "storage_path": "encrypted/x_a.txt",
            "wrapped_key": "AAAA",
            "file_name": "a.txt",
            "mime_type": "text/plain",
            "size": 3,
            "created_at": "2024-01-01T00:00:00Z"
        }"#;
        let record: DocumentRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.format, EnvelopeFormat::Streaming);
        assert_eq!(record.wrapped_key.as_str(), "AAAA");
    }

    #[test]
    fn test_total_pages() {
        let page = DocumentPage {
            documents: Vec::new(),
            page: 1,
            limit: 10,
            total: 21,
        };
        assert_eq!(page.total_pages(), 3);
    }
}
