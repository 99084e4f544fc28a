//! Sled-based metadata store
//!
//! Records are JSON in the `documents` tree keyed by UUID bytes. The
//! `by_time` tree maps `created_at millis (BE) || uuid` to the UUID so pages
//! come out newest first without loading every record.

use crate::error::{Error, Result};
use crate::metadata::{DocumentPage, DocumentRecord, MetadataStore};
use sled::{Db, Tree};
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Sled-backed document metadata
pub struct SledMetadataStore {
    /// Sled database
    db: Db,
    /// Records by id
    documents: Tree,
    /// Creation-time index
    by_time: Tree,
}

impl SledMetadataStore {
    /// Open or create a metadata store
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        let store = Self::from_db(db)?;
        info!(
            "Metadata store opened at {}, {} documents",
            path.as_ref().display(),
            store.documents.len()
        );
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self> {
        let documents = db.open_tree("documents")?;
        let by_time = db.open_tree("by_time")?;
        Ok(SledMetadataStore {
            db,
            documents,
            by_time,
        })
    }

    fn time_key(record: &DocumentRecord) -> [u8; 24] {
        let millis = record.created_at.timestamp_millis().max(0) as u64;
        let mut key = [0u8; 24];
        key[..8].copy_from_slice(&millis.to_be_bytes());
        key[8..].copy_from_slice(record.id.as_bytes());
        key
    }

    fn decode(data: &[u8]) -> Result<DocumentRecord> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl MetadataStore for SledMetadataStore {
    fn save(&self, record: &DocumentRecord) -> Result<()> {
        let data = serde_json::to_vec(record)?;
        let previous = self.documents.insert(record.id.as_bytes(), data)?;

        // A replaced record may carry a different timestamp
        if let Some(previous) = previous {
            let previous = Self::decode(&previous)?;
            self.by_time.remove(Self::time_key(&previous))?;
        }
        self.by_time
            .insert(Self::time_key(record), &record.id.as_bytes()[..])?;

        debug!("Saved record {} ({})", record.id, record.file_name);
        Ok(())
    }

    fn get(&self, id: &Uuid) -> Result<Option<DocumentRecord>> {
        match self.documents.get(id.as_bytes())? {
            Some(data) => Ok(Some(Self::decode(&data)?)),
            None => Ok(None),
        }
    }

    fn delete(&self, id: &Uuid) -> Result<Option<DocumentRecord>> {
        let removed = match self.documents.remove(id.as_bytes())? {
            Some(data) => Self::decode(&data)?,
            None => return Ok(None),
        };
        self.by_time.remove(Self::time_key(&removed))?;
        debug!("Deleted record {}", id);
        Ok(Some(removed))
    }

    fn list(&self, page: usize, limit: usize) -> Result<DocumentPage> {
        let page = page.max(1);
        let total = self.documents.len();
        let mut documents = Vec::with_capacity(limit.min(total));

        let skip = (page - 1).saturating_mul(limit);
        for entry in self.by_time.iter().rev().skip(skip).take(limit) {
            let (_, id_bytes) = entry?;
            let id = Uuid::from_slice(&id_bytes)
                .map_err(|e| Error::Serialization(format!("Corrupt index entry: {}", e)))?;
            match self.get(&id)? {
                Some(record) => documents.push(record),
                None => warn!("Index entry for missing record {}", id),
            }
        }

        Ok(DocumentPage {
            documents,
            page,
            limit,
            total,
        })
    }

    fn count(&self) -> Result<usize> {
        Ok(self.documents.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::WrappedKey;
    use chrono::{Duration, Utc};
    use tempfile::tempdir;

    fn record(name: &str, age_secs: i64) -> DocumentRecord {
        let mut record = DocumentRecord::new(
            format!("encrypted/{}", name),
            WrappedKey::new("d3JhcHBlZA=="),
            name.to_string(),
            "text/plain".to_string(),
            42,
        );
        record.created_at = Utc::now() - Duration::seconds(age_secs);
        record
    }

    #[test]
    fn test_save_and_get() {
        let store = SledMetadataStore::in_memory().unwrap();
        let rec = record("a.txt", 0);
        store.save(&rec).unwrap();

        assert_eq!(store.get(&rec.id).unwrap(), Some(rec));
        assert!(store.get(&Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_delete() {
        let store = SledMetadataStore::in_memory().unwrap();
        let rec = record("a.txt", 0);
        store.save(&rec).unwrap();

        assert_eq!(store.delete(&rec.id).unwrap().map(|r| r.id), Some(rec.id));
        assert!(store.delete(&rec.id).unwrap().is_none());
        assert_eq!(store.count().unwrap(), 0);
        assert!(store.list(1, 10).unwrap().documents.is_empty());
    }

    #[test]
    fn test_list_newest_first_with_pages() {
        let store = SledMetadataStore::in_memory().unwrap();
        for i in 0..5 {
            store.save(&record(&format!("doc{}.txt", i), 100 - i)).unwrap();
        }

        let first = store.list(1, 2).unwrap();
        assert_eq!(first.total, 5);
        assert_eq!(first.total_pages(), 3);
        let names: Vec<_> = first.documents.iter().map(|r| r.file_name.as_str()).collect();
        assert_eq!(names, ["doc4.txt", "doc3.txt"]);

        let last = store.list(3, 2).unwrap();
        assert_eq!(last.documents.len(), 1);
        assert_eq!(last.documents[0].file_name, "doc0.txt");

        assert!(store.list(4, 2).unwrap().documents.is_empty());
        // Page 0 is treated as the first page
        assert_eq!(store.list(0, 2).unwrap().page, 1);
    }

    #[test]
    fn test_resave_moves_index_entry() {
        let store = SledMetadataStore::in_memory().unwrap();
        let mut rec = record("a.txt", 50);
        store.save(&rec).unwrap();
        store.save(&record("b.txt", 10)).unwrap();

        rec.created_at = Utc::now();
        store.save(&rec).unwrap();

        let page = store.list(1, 10).unwrap();
        assert_eq!(page.documents.len(), 2);
        assert_eq!(page.documents[0].file_name, "a.txt");
    }

    #[test]
    fn test_reopen_persists() {
        let dir = tempdir().unwrap();
        let rec = record("kept.pdf", 0);
        {
            let store = SledMetadataStore::open(dir.path().join("db")).unwrap();
            store.save(&rec).unwrap();
            store.flush().unwrap();
        }

        let store = SledMetadataStore::open(dir.path().join("db")).unwrap();
        assert_eq!(store.get(&rec.id).unwrap(), Some(rec));
    }
}
