//! The store contract consumed by the replication engine.

use crate::query::Query;
use crate::record::{Document, OplogEntry};
use meshdb_common::HlcTimestamp;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("store integrity failure: {0}")]
    Integrity(String),
}

/// Durable key→latest-document map plus oplog range reads.
///
/// Implementations must make `apply_batch` atomic: either every document
/// row and every oplog entry in the call is applied, or none are. The
/// engine funnels both local mutations and merged remote batches through
/// that one method.
///
/// Callers serialize mutations through a single writer handle (the engine
/// holds the store behind an async RwLock), so implementations are plain
/// `&mut self` and may use blocking I/O.
pub trait DocumentStore: Send + Sync {
    /// Upsert a document row by `(collection, key)`.
    fn save_document(&mut self, doc: Document) -> Result<(), StoreError>;

    /// Latest row for `(collection, key)`, tombstones included.
    fn get_document(&self, collection: &str, key: &str) -> Result<Option<Document>, StoreError>;

    /// Append one oplog entry. Idempotent: an entry whose HLC already
    /// exists in the log is silently skipped.
    fn append_oplog(&mut self, entry: OplogEntry) -> Result<(), StoreError>;

    /// All entries with timestamp strictly greater than `after`, ordered
    /// by `(wall, logical)` ascending.
    fn oplog_since(&self, after: &HlcTimestamp) -> Result<Vec<OplogEntry>, StoreError>;

    /// Every entry for one `(collection, key)` in HLC order. The merge
    /// engine rebuilds rows from this when the resolver needs the full
    /// history rather than a latest-wins gate.
    fn oplog_for_key(&self, collection: &str, key: &str) -> Result<Vec<OplogEntry>, StoreError>;

    /// Timestamp of the latest oplog entry, or zero when the log is empty.
    fn latest_timestamp(&self) -> Result<HlcTimestamp, StoreError>;

    /// Atomically apply document upserts and oplog appends.
    fn apply_batch(
        &mut self,
        docs: Vec<Document>,
        entries: Vec<OplogEntry>,
    ) -> Result<(), StoreError>;

    /// Live documents in a collection matching `query`, with ordering and
    /// paging applied. Tombstones are not returned.
    fn query(&self, collection: &str, query: &Query) -> Result<Vec<Document>, StoreError>;
}
