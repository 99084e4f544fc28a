//! Document metadata
//!
//! Records hold the wrapped data key and where the envelope lives. Nothing
//! stored here can decrypt a document without the master private key.

mod record;
mod store;

pub use record::{DocumentPage, DocumentRecord, EnvelopeFormat};
pub use store::SledMetadataStore;

use crate::error::Result;
use uuid::Uuid;

/// Record persistence consumed by the vault
pub trait MetadataStore: Send + Sync {
    /// Insert or replace a record
    fn save(&self, record: &DocumentRecord) -> Result<()>;

    fn get(&self, id: &Uuid) -> Result<Option<DocumentRecord>>;

    /// Remove a record, returning it if it existed
    fn delete(&self, id: &Uuid) -> Result<Option<DocumentRecord>>;

    /// Page through records newest first; `page` is 1-based
    fn list(&self, page: usize, limit: usize) -> Result<DocumentPage>;

    fn count(&self) -> Result<usize>;
}
