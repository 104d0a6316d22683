//! Storage engine: combines the WAL with the in-memory tables.
//!
//! All writes go through the WAL first (for durability), then into the
//! tables (for fast reads). One WAL frame per `apply_batch` call is what
//! makes the document+oplog pair atomic: replay either sees the whole
//! frame or none of it.

use crate::query::{compare_values, lookup, Query};
use crate::record::{Document, OplogEntry};
use crate::store::{DocumentStore, StoreError};
use crate::tables::{DocTable, OplogTable};
use crate::wal::{FsyncPolicy, Wal, WalBatch, WalError};
use meshdb_common::HlcTimestamp;
use std::path::Path;

impl From<WalError> for StoreError {
    fn from(e: WalError) -> Self {
        match e {
            WalError::Io(io) => StoreError::Io(io),
            WalError::Serde(s) => StoreError::Serde(s),
            WalError::BadHeader => {
                StoreError::Integrity("WAL header is not a meshdb log".into())
            }
        }
    }
}

/// The default durable store. Synchronous blocking I/O; the async
/// boundary is at the caller (engine layer).
#[derive(Debug)]
pub struct StorageEngine {
    docs: DocTable,
    oplog: OplogTable,
    wal: Wal,
}

impl StorageEngine {
    /// Open or create a storage engine at the given directory.
    pub fn open(data_dir: &Path, fsync: FsyncPolicy) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir)?;
        let wal_path = data_dir.join("meshdb.wal");

        // Replay WAL to rebuild both tables.
        let batches = Wal::replay(&wal_path)?;
        let mut docs = DocTable::new();
        let mut oplog = OplogTable::new();
        for batch in batches {
            for doc in batch.docs {
                docs.upsert(doc);
            }
            for entry in batch.entries {
                oplog.append(entry);
            }
        }

        let wal = Wal::open(&wal_path, fsync)?;

        tracing::info!(
            "storage engine opened: {} document(s), {} oplog entrie(s) recovered from {:?}",
            docs.len(),
            oplog.len(),
            wal_path
        );

        Ok(Self { docs, oplog, wal })
    }

    /// Number of document rows (tombstones included).
    pub fn document_count(&self) -> usize {
        self.docs.len()
    }

    /// Number of oplog entries.
    pub fn oplog_len(&self) -> usize {
        self.oplog.len()
    }

    /// Sync the WAL to disk (for batch fsync mode).
    pub fn sync(&mut self) -> Result<(), StoreError> {
        self.wal.sync()?;
        Ok(())
    }
}

impl DocumentStore for StorageEngine {
    fn save_document(&mut self, doc: Document) -> Result<(), StoreError> {
        self.wal.append(&WalBatch {
            docs: vec![doc.clone()],
            entries: vec![],
        })?;
        self.docs.upsert(doc);
        Ok(())
    }

    fn get_document(&self, collection: &str, key: &str) -> Result<Option<Document>, StoreError> {
        Ok(self.docs.get(collection, key).cloned())
    }

    fn append_oplog(&mut self, entry: OplogEntry) -> Result<(), StoreError> {
        if self.oplog.contains(&entry.timestamp) {
            return Ok(()); // idempotent re-push
        }
        self.wal.append(&WalBatch {
            docs: vec![],
            entries: vec![entry.clone()],
        })?;
        self.oplog.append(entry);
        Ok(())
    }

    fn oplog_since(&self, after: &HlcTimestamp) -> Result<Vec<OplogEntry>, StoreError> {
        Ok(self.oplog.since(after))
    }

    fn oplog_for_key(&self, collection: &str, key: &str) -> Result<Vec<OplogEntry>, StoreError> {
        Ok(self.oplog.for_key(collection, key))
    }

    fn latest_timestamp(&self) -> Result<HlcTimestamp, StoreError> {
        Ok(self.oplog.max())
    }

    fn apply_batch(
        &mut self,
        docs: Vec<Document>,
        entries: Vec<OplogEntry>,
    ) -> Result<(), StoreError> {
        // Drop entries the log already has so re-pushed batches don't grow
        // the WAL; the surviving frame still covers docs + new entries.
        let fresh: Vec<OplogEntry> = entries
            .into_iter()
            .filter(|e| !self.oplog.contains(&e.timestamp))
            .collect();

        if docs.is_empty() && fresh.is_empty() {
            return Ok(());
        }

        self.wal.append(&WalBatch {
            docs: docs.clone(),
            entries: fresh.clone(),
        })?;

        for doc in docs {
            self.docs.upsert(doc);
        }
        for entry in fresh {
            self.oplog.append(entry);
        }
        Ok(())
    }

    fn query(&self, collection: &str, query: &Query) -> Result<Vec<Document>, StoreError> {
        let mut rows: Vec<&Document> = self
            .docs
            .collection(collection)
            .into_iter()
            .filter(|d| !d.deleted)
            .collect();

        // Parse each body once; rows whose body fails to parse are only
        // excluded when the query actually needs to inspect the body.
        let needs_body = query.predicate.is_some() || query.order_by.is_some();
        let mut parsed: Vec<(&Document, Option<serde_json::Value>)> = rows
            .drain(..)
            .map(|d| {
                let value = d
                    .body
                    .as_deref()
                    .and_then(|b| serde_json::from_str(b).ok());
                (d, value)
            })
            .filter(|(_, v)| !needs_body || v.is_some())
            .collect();

        if let Some(pred) = &query.predicate {
            parsed.retain(|(_, v)| v.as_ref().is_some_and(|v| pred.matches(v)));
        }

        match &query.order_by {
            Some(field) => {
                // Rows missing the field sort after present ones; ties and
                // incomparable pairs fall back to the key for determinism.
                parsed.sort_by(|(da, va), (db, vb)| {
                    let fa = va.as_ref().and_then(|v| lookup(v, field));
                    let fb = vb.as_ref().and_then(|v| lookup(v, field));
                    let ord = match (fa, fb) {
                        (Some(a), Some(b)) => {
                            compare_values(a, b).unwrap_or(std::cmp::Ordering::Equal)
                        }
                        (Some(_), None) => std::cmp::Ordering::Less,
                        (None, Some(_)) => std::cmp::Ordering::Greater,
                        (None, None) => std::cmp::Ordering::Equal,
                    };
                    let ord = if query.ascending { ord } else { ord.reverse() };
                    ord.then_with(|| da.key.cmp(&db.key))
                });
            }
            None => parsed.sort_by(|(a, _), (b, _)| a.key.cmp(&b.key)),
        }

        let skip = query.skip.unwrap_or(0);
        let take = query.take.unwrap_or(usize::MAX);
        Ok(parsed
            .into_iter()
            .skip(skip)
            .take(take)
            .map(|(d, _)| d.clone())
            .collect())
    }
}
