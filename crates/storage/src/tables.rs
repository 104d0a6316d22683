//! In-memory tables rebuilt from the WAL at open.
//!
//! `DocTable` holds the latest row per `(collection, key)`; `OplogTable`
//! holds every accepted entry keyed by its HLC so range reads come back
//! in `(wall, logical, node)` order.

use crate::record::{Document, OplogEntry};
use meshdb_common::{HlcTimestamp, NodeId};
use std::collections::{BTreeMap, HashMap};

/// Latest document row per `(collection, key)`.
#[derive(Debug, Default)]
pub struct DocTable {
    rows: HashMap<(String, String), Document>,
}

impl DocTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, collection: &str, key: &str) -> Option<&Document> {
        self.rows
            .get(&(collection.to_string(), key.to_string()))
    }

    /// Unconditional upsert. HLC gating happens in the merge engine, not
    /// here; the table stores whatever the caller decided is the latest.
    pub fn upsert(&mut self, doc: Document) {
        self.rows
            .insert((doc.collection.clone(), doc.key.clone()), doc);
    }

    /// All rows in a collection, tombstones included.
    pub fn collection(&self, collection: &str) -> Vec<&Document> {
        self.rows
            .values()
            .filter(|d| d.collection == collection)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Ordered oplog keyed by the full HLC triple.
#[derive(Debug, Default)]
pub struct OplogTable {
    entries: BTreeMap<(i64, i32, NodeId), OplogEntry>,
}

impl OplogTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn key_of(ts: &HlcTimestamp) -> (i64, i32, NodeId) {
        (ts.wall, ts.logical, ts.node.clone())
    }

    /// True if an entry with this exact HLC is already present.
    pub fn contains(&self, ts: &HlcTimestamp) -> bool {
        self.entries.contains_key(&Self::key_of(ts))
    }

    /// Insert an entry. Returns false (and keeps the existing entry) when
    /// an entry with an identical HLC is already present.
    pub fn append(&mut self, entry: OplogEntry) -> bool {
        let key = Self::key_of(&entry.timestamp);
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, entry);
        true
    }

    /// Entries with timestamp strictly greater than `after`, ascending.
    pub fn since(&self, after: &HlcTimestamp) -> Vec<OplogEntry> {
        use std::ops::Bound;
        let from = Bound::Excluded(Self::key_of(after));
        self.entries
            .range((from, Bound::Unbounded))
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Every entry for one `(collection, key)`, in HLC order. Used by
    /// resolvers that rebuild a row from its full op history.
    pub fn for_key(&self, collection: &str, key: &str) -> Vec<OplogEntry> {
        self.entries
            .values()
            .filter(|e| e.collection == collection && e.key == key)
            .cloned()
            .collect()
    }

    /// Timestamp of the latest entry, or zero when empty.
    pub fn max(&self) -> HlcTimestamp {
        self.entries
            .values()
            .next_back()
            .map(|e| e.timestamp.clone())
            .unwrap_or_else(HlcTimestamp::zero)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(wall: i64, logical: i32, node: &str) -> HlcTimestamp {
        HlcTimestamp::new(wall, logical, NodeId::from(node))
    }

    fn entry(wall: i64, logical: i32, node: &str) -> OplogEntry {
        OplogEntry::put("c", format!("k{}", wall), "{}", ts(wall, logical, node))
    }

    #[test]
    fn test_doc_table_upsert_replaces() {
        let mut t = DocTable::new();
        t.upsert(Document::put("c", "k", "{\"v\":1}", ts(1, 0, "a")));
        t.upsert(Document::put("c", "k", "{\"v\":2}", ts(2, 0, "a")));
        assert_eq!(t.len(), 1);
        assert_eq!(t.get("c", "k").unwrap().body.as_deref(), Some("{\"v\":2}"));
    }

    #[test]
    fn test_doc_table_collections_are_disjoint() {
        let mut t = DocTable::new();
        t.upsert(Document::put("users", "k", "{}", ts(1, 0, "a")));
        t.upsert(Document::put("orders", "k", "{}", ts(1, 0, "a")));
        assert_eq!(t.len(), 2);
        assert_eq!(t.collection("users").len(), 1);
        assert!(t.get("users", "k").is_some());
        assert!(t.get("orders", "k").is_some());
    }

    #[test]
    fn test_oplog_append_idempotent() {
        let mut log = OplogTable::new();
        assert!(log.append(entry(1, 0, "a")));
        assert!(!log.append(entry(1, 0, "a")), "identical HLC must be skipped");
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_oplog_since_strictly_greater() {
        let mut log = OplogTable::new();
        for w in 1..=5 {
            log.append(entry(w, 0, "a"));
        }
        let out = log.since(&ts(3, 0, "a"));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].timestamp.wall, 4);
        assert_eq!(out[1].timestamp.wall, 5);
    }

    #[test]
    fn test_oplog_since_zero_returns_all_sorted() {
        let mut log = OplogTable::new();
        log.append(entry(3, 0, "a"));
        log.append(entry(1, 0, "a"));
        log.append(entry(2, 1, "a"));
        log.append(entry(2, 0, "b"));

        let out = log.since(&HlcTimestamp::zero());
        let walls: Vec<(i64, i32)> = out.iter().map(|e| e.timestamp.sort_key()).collect();
        assert_eq!(walls, vec![(1, 0), (2, 0), (2, 1), (3, 0)]);
    }

    #[test]
    fn test_oplog_same_wall_ordered_by_node() {
        let mut log = OplogTable::new();
        log.append(entry(1, 0, "b"));
        log.append(entry(1, 0, "a"));
        let out = log.since(&HlcTimestamp::zero());
        assert_eq!(out[0].timestamp.node.as_str(), "a");
        assert_eq!(out[1].timestamp.node.as_str(), "b");
    }

    #[test]
    fn test_oplog_for_key_filters_and_sorts() {
        let mut log = OplogTable::new();
        log.append(OplogEntry::put("c", "k", "{}", ts(3, 0, "a")));
        log.append(OplogEntry::put("c", "k", "{}", ts(1, 0, "a")));
        log.append(OplogEntry::put("c", "other", "{}", ts(2, 0, "a")));
        log.append(OplogEntry::put("d", "k", "{}", ts(4, 0, "a")));

        let history = log.for_key("c", "k");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].timestamp.wall, 1);
        assert_eq!(history[1].timestamp.wall, 3);
    }

    #[test]
    fn test_oplog_max() {
        let mut log = OplogTable::new();
        assert!(log.max().is_zero());
        log.append(entry(1, 0, "a"));
        log.append(entry(7, 2, "b"));
        log.append(entry(4, 0, "c"));
        assert_eq!(log.max(), ts(7, 2, "b"));
    }
}
