//! The document API: the front door for local reads and writes.

use crate::clock::HlcClock;
use crate::merge::{MergeEngine, MergeError};
use crate::resolver::ConflictResolver;
use meshdb_common::HlcTimestamp;
use meshdb_storage::query::Query;
use meshdb_storage::record::{Document, OplogEntry};
use meshdb_storage::store::{DocumentStore, StoreError};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Merge(#[from] MergeError),
}

/// A node's local database handle.
///
/// Local mutations tick the HLC and land as one atomic store call
/// (document row + oplog entry); remote batches go through the merge
/// engine. Clones share the same store, clock, and merge engine.
pub struct Database<S: DocumentStore> {
    store: Arc<RwLock<S>>,
    clock: Arc<HlcClock>,
    merge: Arc<MergeEngine<S>>,
}

impl<S: DocumentStore> Clone for Database<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            clock: self.clock.clone(),
            merge: self.merge.clone(),
        }
    }
}

impl<S: DocumentStore> Database<S> {
    /// Wire up a database over an opened store.
    ///
    /// Observes the store's latest timestamp so the first tick after a
    /// restart is strictly greater than anything already persisted.
    pub async fn open(
        store: Arc<RwLock<S>>,
        clock: Arc<HlcClock>,
        resolver: Arc<dyn ConflictResolver>,
    ) -> Result<Self, DbError> {
        let max = store.read().await.latest_timestamp()?;
        if !max.is_zero() {
            clock.observe(&max);
        }
        let merge = Arc::new(MergeEngine::new(store.clone(), clock.clone(), resolver));
        Ok(Self {
            store,
            clock,
            merge,
        })
    }

    pub fn clock(&self) -> &Arc<HlcClock> {
        &self.clock
    }

    pub fn merge_engine(&self) -> &Arc<MergeEngine<S>> {
        &self.merge
    }

    /// Upsert a document. `body` is opaque JSON text.
    pub async fn put(
        &self,
        collection: &str,
        key: &str,
        body: impl Into<String>,
    ) -> Result<HlcTimestamp, DbError> {
        meshdb_metrics::metrics().doc_puts.inc();
        let ts = self.clock.tick();
        let entry = OplogEntry::put(collection, key, body, ts.clone());
        let mut store = self.store.write().await;
        store.apply_batch(vec![entry.to_document()], vec![entry])?;
        Ok(ts)
    }

    /// Delete a key. Legal for a never-seen key: it creates a tombstone
    /// so the delete still dominates late-arriving older puts.
    pub async fn delete(&self, collection: &str, key: &str) -> Result<HlcTimestamp, DbError> {
        meshdb_metrics::metrics().doc_deletes.inc();
        let ts = self.clock.tick();
        let entry = OplogEntry::delete(collection, key, ts.clone());
        let mut store = self.store.write().await;
        store.apply_batch(vec![entry.to_document()], vec![entry])?;
        Ok(ts)
    }

    /// Latest live document, or `None` when absent or tombstoned.
    pub async fn get(&self, collection: &str, key: &str) -> Result<Option<Document>, DbError> {
        meshdb_metrics::metrics().doc_gets.inc();
        let doc = self.store.read().await.get_document(collection, key)?;
        Ok(doc.filter(|d| !d.deleted))
    }

    /// Query live documents in a collection.
    pub async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Document>, DbError> {
        Ok(self.store.read().await.query(collection, query)?)
    }

    /// Oplog entries newer than `after` (for the sync layer).
    pub async fn oplog_since(&self, after: &HlcTimestamp) -> Result<Vec<OplogEntry>, DbError> {
        Ok(self.store.read().await.oplog_since(after)?)
    }

    /// Latest accepted timestamp (the "local clock" of the sync protocol).
    pub async fn latest_timestamp(&self) -> Result<HlcTimestamp, DbError> {
        Ok(self.store.read().await.latest_timestamp()?)
    }

    /// Ingest a batch of remote entries.
    pub async fn apply_remote(&self, batch: Vec<OplogEntry>) -> Result<(), DbError> {
        Ok(self.merge.apply_batch(batch).await?)
    }
}

impl<S: DocumentStore> std::fmt::Debug for Database<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("node", self.clock.node_id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTimeSource;
    use crate::resolver::LastWriteWins;
    use meshdb_common::NodeId;
    use meshdb_storage::engine::StorageEngine;
    use meshdb_storage::query::Predicate;
    use meshdb_storage::wal::FsyncPolicy;
    use tempfile::TempDir;

    async fn open_db(dir: &std::path::Path, node: &str, start: i64) -> Database<StorageEngine> {
        let engine = StorageEngine::open(dir, FsyncPolicy::None).unwrap();
        let clock = Arc::new(HlcClock::with_time_source(
            NodeId::from(node),
            Arc::new(ManualTimeSource::at(start)),
        ));
        Database::open(Arc::new(RwLock::new(engine)), clock, Arc::new(LastWriteWins))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let dir = TempDir::new().unwrap();
        let db = open_db(dir.path(), "a", 100).await;

        let ts = db.put("users", "u1", r#"{"name":"Alice"}"#).await.unwrap();
        let doc = db.get("users", "u1").await.unwrap().unwrap();
        assert_eq!(doc.body.as_deref(), Some(r#"{"name":"Alice"}"#));
        assert_eq!(doc.updated_at, ts);
    }

    #[tokio::test]
    async fn test_successive_puts_have_increasing_hlcs() {
        let dir = TempDir::new().unwrap();
        let db = open_db(dir.path(), "a", 100).await;

        let t1 = db.put("c", "k", "{}").await.unwrap();
        let t2 = db.put("c", "k", "{}").await.unwrap();
        let t3 = db.delete("c", "k").await.unwrap();
        assert!(t1 < t2);
        assert!(t2 < t3);
    }

    #[tokio::test]
    async fn test_delete_hides_from_get() {
        let dir = TempDir::new().unwrap();
        let db = open_db(dir.path(), "a", 100).await;

        db.put("users", "u1", "{}").await.unwrap();
        db.delete("users", "u1").await.unwrap();
        assert!(db.get("users", "u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_unknown_key_creates_tombstone() {
        let dir = TempDir::new().unwrap();
        let db = open_db(dir.path(), "a", 100).await;

        let ts = db.delete("users", "ghost").await.unwrap();
        assert!(db.get("users", "ghost").await.unwrap().is_none());

        // The tombstone exists and carries the delete's HLC.
        let row = db
            .store
            .read()
            .await
            .get_document("users", "ghost")
            .unwrap()
            .unwrap();
        assert!(row.deleted);
        assert_eq!(row.updated_at, ts);
    }

    #[tokio::test]
    async fn test_mutation_is_one_atomic_store_call() {
        let dir = TempDir::new().unwrap();
        let db = open_db(dir.path(), "a", 100).await;

        db.put("c", "k", "{}").await.unwrap();
        let store = db.store.read().await;
        assert_eq!(store.document_count(), 1);
        assert_eq!(store.oplog_len(), 1);
        let doc = store.get_document("c", "k").unwrap().unwrap();
        let max = store.latest_timestamp().unwrap();
        assert_eq!(doc.updated_at, max, "row HLC equals oplog max (I1)");
    }

    #[tokio::test]
    async fn test_restart_keeps_ticking_forward() {
        let dir = TempDir::new().unwrap();
        let first_ts = {
            let db = open_db(dir.path(), "a", 10_000).await;
            db.put("c", "k", "{}").await.unwrap()
        };

        // Restart with a wall clock far behind the persisted timestamps.
        let db = open_db(dir.path(), "a", 10).await;
        let next = db.put("c", "k", "{}").await.unwrap();
        assert!(next > first_ts, "post-restart HLC must not regress");
    }

    #[tokio::test]
    async fn test_query_through_db() {
        let dir = TempDir::new().unwrap();
        let db = open_db(dir.path(), "a", 100).await;

        db.put("users", "u1", r#"{"age":25}"#).await.unwrap();
        db.put("users", "u2", r#"{"age":35}"#).await.unwrap();
        db.delete("users", "u1").await.unwrap();

        let out = db
            .query("users", &Query::filter(Predicate::gt("age", 20)))
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].key, "u2");
    }
}
