//! Error types for docvault

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for docvault
#[derive(Error, Debug)]
pub enum Error {
    // Key management errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Key operation failed: {0}")]
    KeyOperation(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    // Envelope errors
    /// The only decryption outcome callers outside this crate should see.
    #[error("decryption failed")]
    DecryptionFailed,

    #[error("Envelope too short: {received} bytes")]
    StreamTooShort { received: u64 },

    #[error("Envelope authentication tag mismatch")]
    Integrity,

    #[error("Plaintext exceeds the AES-GCM message limit")]
    MessageTooLong,

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid storage path: {0}")]
    InvalidStoragePath(String),

    // Metadata errors
    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Document too large: exceeds limit of {limit} bytes")]
    DocumentTooLarge { limit: u64 },

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    // IO errors from sources and sinks, passed through untouched
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Whether retrying the operation could succeed.
    ///
    /// Key and envelope failures never heal on retry; only transport
    /// failures do, and the decision belongs to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Storage(_))
    }

    /// True for every variant that describes why an envelope did not open.
    pub fn is_decryption_failure(&self) -> bool {
        matches!(
            self,
            Error::DecryptionFailed | Error::StreamTooShort { .. } | Error::Integrity
        )
    }

    /// Collapse decryption detail into the generic outcome shown to callers.
    pub fn public(self) -> Self {
        if self.is_decryption_failure() {
            Error::DecryptionFailed
        } else {
            self
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_hides_detail() {
        let err = Error::StreamTooShort { received: 5 }.public();
        assert!(matches!(err, Error::DecryptionFailed));
        assert_eq!(err.to_string(), "decryption failed");

        assert!(matches!(Error::Integrity.public(), Error::DecryptionFailed));
    }

    #[test]
    fn test_public_keeps_other_errors() {
        let err = Error::DocumentNotFound("abc".into()).public();
        assert!(matches!(err, Error::DocumentNotFound(_)));
    }

    #[test]
    fn test_retryable() {
        assert!(Error::Io(io::Error::new(io::ErrorKind::Other, "reset")).is_retryable());
        assert!(!Error::Integrity.is_retryable());
        assert!(!Error::Configuration("missing".into()).is_retryable());
    }
}
