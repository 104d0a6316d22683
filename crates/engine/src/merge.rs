//! The merge engine: folds remote oplog batches into the local store.
//!
//! Per key, entries apply in HLC order so the final state is
//! deterministic no matter how a batch was cut or in which order batches
//! arrive. With last-write-wins the stored row's timestamp gates stale
//! ops outright; with field-merge a late-arriving older op still carries
//! information, so the row is rebuilt by folding the key's full op
//! history. The whole batch lands in one atomic store call, and every
//! received timestamp is observed into the clock afterwards.

use crate::clock::HlcClock;
use crate::resolver::ConflictResolver;
use meshdb_common::HlcTimestamp;
use meshdb_storage::record::{Document, Operation, OplogEntry};
use meshdb_storage::store::{DocumentStore, StoreError};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Ingests remote oplog batches.
pub struct MergeEngine<S: DocumentStore> {
    store: Arc<RwLock<S>>,
    clock: Arc<HlcClock>,
    resolver: Arc<dyn ConflictResolver>,
}

impl<S: DocumentStore> MergeEngine<S> {
    pub fn new(
        store: Arc<RwLock<S>>,
        clock: Arc<HlcClock>,
        resolver: Arc<dyn ConflictResolver>,
    ) -> Self {
        Self {
            store,
            clock,
            resolver,
        }
    }

    /// Apply one batch of remote entries. The batch may arrive in any
    /// order and may contain duplicates of entries already applied.
    pub async fn apply_batch(&self, batch: Vec<OplogEntry>) -> Result<(), MergeError> {
        if batch.is_empty() {
            return Ok(());
        }

        // Group by (collection, key) and sort each group by HLC ascending
        // so application order is deterministic.
        let mut groups: HashMap<(String, String), Vec<OplogEntry>> = HashMap::new();
        for entry in &batch {
            groups
                .entry((entry.collection.clone(), entry.key.clone()))
                .or_default()
                .push(entry.clone());
        }
        for group in groups.values_mut() {
            group.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        }

        {
            let mut store = self.store.write().await;

            let mut winners: Vec<Document> = Vec::new();
            for ((collection, key), group) in groups {
                let doc = if self.resolver.needs_full_history() {
                    self.fold_full_history(&*store, &collection, &key, group)?
                } else {
                    let current = store.get_document(&collection, &key)?;
                    self.fold_incremental(current, group)
                };
                if let Some(doc) = doc {
                    winners.push(doc);
                }
            }

            // One store call covers the winning rows and every entry in
            // the batch (idempotently), which is what keeps (I1)/(I5).
            store.apply_batch(winners, batch.clone())?;
        }

        // The clock never regresses behind received causality.
        for entry in &batch {
            self.clock.observe(&entry.timestamp);
        }

        let m = meshdb_metrics::metrics();
        m.batches_merged.inc();
        m.entries_merged.inc_by(batch.len() as u64);

        Ok(())
    }

    /// Last-write-wins path: walk one key's new entries in HLC order
    /// over the current row, gated on strict supersession. Returns the
    /// new row, or `None` when nothing superseded it.
    fn fold_incremental(
        &self,
        current: Option<Document>,
        group: Vec<OplogEntry>,
    ) -> Option<Document> {
        let mut local_hlc = current
            .as_ref()
            .map(|d| d.updated_at.clone())
            .unwrap_or_else(HlcTimestamp::zero);
        let mut body: Option<String> = current
            .as_ref()
            .and_then(|d| if d.deleted { None } else { d.body.clone() });
        let mut result: Option<Document> = None;

        for entry in group {
            if entry.timestamp <= local_hlc {
                // Already superseded; the oplog append still happens via
                // the batch (idempotently).
                continue;
            }

            let doc = match entry.op {
                Operation::Delete => {
                    body = None;
                    Document::tombstone(&entry.collection, &entry.key, entry.timestamp.clone())
                }
                Operation::Put => {
                    let merged = self.merge_bodies(&entry, body.as_deref(), &local_hlc);
                    body = Some(merged.clone());
                    Document::put(&entry.collection, &entry.key, merged, entry.timestamp.clone())
                }
            };

            local_hlc = entry.timestamp.clone();
            result = Some(doc);
        }

        result
    }

    /// Field-merge path: rebuild the row by folding the union of the
    /// key's stored history and the incoming group, in HLC order. Every
    /// replica that has the same op set folds to byte-identical state.
    fn fold_full_history(
        &self,
        store: &S,
        collection: &str,
        key: &str,
        group: Vec<OplogEntry>,
    ) -> Result<Option<Document>, MergeError> {
        let mut ops = store.oplog_for_key(collection, key)?;
        let known: HashSet<HlcTimestamp> = ops.iter().map(|e| e.timestamp.clone()).collect();

        let mut any_new = false;
        for entry in group {
            if !known.contains(&entry.timestamp) {
                ops.push(entry);
                any_new = true;
            }
        }
        if !any_new {
            return Ok(None); // pure duplicate; the row already reflects the fold
        }
        ops.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

        let mut body: Option<String> = None;
        let mut prev_hlc = HlcTimestamp::zero();
        let mut deleted = false;

        for entry in &ops {
            match entry.op {
                Operation::Delete => {
                    body = None;
                    deleted = true;
                }
                Operation::Put => {
                    body = Some(self.merge_bodies(entry, body.as_deref(), &prev_hlc));
                    deleted = false;
                }
            }
            prev_hlc = entry.timestamp.clone();
        }

        Ok(Some(if deleted {
            Document::tombstone(collection, key, prev_hlc)
        } else {
            Document {
                collection: collection.to_string(),
                key: key.to_string(),
                body,
                updated_at: prev_hlc,
                deleted: false,
            }
        }))
    }

    /// Run the resolver for one put, falling back to last-write-wins on
    /// resolver errors so malformed JSON never poisons a batch.
    fn merge_bodies(
        &self,
        entry: &OplogEntry,
        current: Option<&str>,
        current_hlc: &HlcTimestamp,
    ) -> String {
        let remote_body = entry.body.as_deref().unwrap_or("null");
        match self
            .resolver
            .merge(current, remote_body, current_hlc, &entry.timestamp)
        {
            Ok(merged) => merged,
            Err(e) => {
                meshdb_metrics::metrics().resolver_fallbacks.inc();
                tracing::warn!(
                    "resolver {} failed for {}/{}: {}; falling back to LWW",
                    self.resolver.name(),
                    entry.collection,
                    entry.key,
                    e
                );
                remote_body.to_string()
            }
        }
    }
}

impl<S: DocumentStore> std::fmt::Debug for MergeEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeEngine")
            .field("resolver", &self.resolver.name())
            .finish_non_exhaustive()
    }
}
