//! docvault - Encrypted document storage
//!
//! Each document is sealed under its own AES-256-GCM data key, and that key
//! is stored only after wrapping under an RSA-OAEP master keypair. Bodies are
//! encrypted and decrypted as streams, so memory use does not grow with
//! document size.

pub mod config;
pub mod crypto;
pub mod error;
pub mod metadata;
pub mod storage;
pub mod vault;

pub use config::Config;
pub use error::{Error, Result};
pub use vault::{DocumentVault, VaultLimits};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::crypto::{DataKey, KeyManager, WrappedKey};
    pub use crate::error::{Error, Result};
    pub use crate::metadata::{DocumentRecord, MetadataStore};
    pub use crate::storage::StorageAdapter;
    pub use crate::vault::DocumentVault;
}
