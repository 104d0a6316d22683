//! Document and oplog record formats.

use meshdb_common::HlcTimestamp;
use serde::{Deserialize, Serialize};

/// The two mutation kinds carried by the oplog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Put,
    Delete,
}

/// The latest known state of one `(collection, key)` pair.
///
/// Tombstones (`deleted = true`, `body = None`) are permanent: they carry
/// their own HLC so a delete survives and dominates late-arriving older
/// puts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub collection: String,
    pub key: String,
    /// Opaque JSON text; absent when deleted.
    pub body: Option<String>,
    pub updated_at: HlcTimestamp,
    pub deleted: bool,
}

impl Document {
    /// Create a live document row.
    pub fn put(
        collection: impl Into<String>,
        key: impl Into<String>,
        body: impl Into<String>,
        updated_at: HlcTimestamp,
    ) -> Self {
        Self {
            collection: collection.into(),
            key: key.into(),
            body: Some(body.into()),
            updated_at,
            deleted: false,
        }
    }

    /// Create a tombstone row.
    pub fn tombstone(
        collection: impl Into<String>,
        key: impl Into<String>,
        updated_at: HlcTimestamp,
    ) -> Self {
        Self {
            collection: collection.into(),
            key: key.into(),
            body: None,
            updated_at,
            deleted: true,
        }
    }
}

/// One accepted mutation. Append-only; never mutated or removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OplogEntry {
    pub collection: String,
    pub key: String,
    pub op: Operation,
    /// JSON body for `Put`; `None` for `Delete`.
    pub body: Option<String>,
    pub timestamp: HlcTimestamp,
}

impl OplogEntry {
    pub fn put(
        collection: impl Into<String>,
        key: impl Into<String>,
        body: impl Into<String>,
        timestamp: HlcTimestamp,
    ) -> Self {
        Self {
            collection: collection.into(),
            key: key.into(),
            op: Operation::Put,
            body: Some(body.into()),
            timestamp,
        }
    }

    pub fn delete(
        collection: impl Into<String>,
        key: impl Into<String>,
        timestamp: HlcTimestamp,
    ) -> Self {
        Self {
            collection: collection.into(),
            key: key.into(),
            op: Operation::Delete,
            body: None,
            timestamp,
        }
    }

    /// The document row this entry produces when it wins.
    pub fn to_document(&self) -> Document {
        match self.op {
            Operation::Put => Document {
                collection: self.collection.clone(),
                key: self.key.clone(),
                body: self.body.clone(),
                updated_at: self.timestamp.clone(),
                deleted: false,
            },
            Operation::Delete => Document::tombstone(
                self.collection.clone(),
                self.key.clone(),
                self.timestamp.clone(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshdb_common::NodeId;

    fn ts(wall: i64) -> HlcTimestamp {
        HlcTimestamp::new(wall, 0, NodeId::from("n1"))
    }

    #[test]
    fn test_put_entry_to_document() {
        let e = OplogEntry::put("users", "u1", r#"{"name":"Alice"}"#, ts(100));
        let doc = e.to_document();
        assert!(!doc.deleted);
        assert_eq!(doc.body.as_deref(), Some(r#"{"name":"Alice"}"#));
        assert_eq!(doc.updated_at, ts(100));
    }

    #[test]
    fn test_delete_entry_to_tombstone() {
        let e = OplogEntry::delete("users", "u1", ts(200));
        let doc = e.to_document();
        assert!(doc.deleted);
        assert!(doc.body.is_none());
    }

    #[test]
    fn test_delete_entry_has_no_body() {
        let e = OplogEntry::delete("users", "u1", ts(1));
        assert_eq!(e.op, Operation::Delete);
        assert!(e.body.is_none());
    }
}
