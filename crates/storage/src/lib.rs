//! Storage layer for meshdb: WAL + in-memory document and oplog tables.
//!
//! Defines the [`DocumentStore`] contract the replication engine consumes,
//! the document/oplog record types, the query predicate AST, and the
//! default durable implementation ([`StorageEngine`]).

pub mod engine;
pub mod query;
pub mod record;
pub mod store;
pub mod tables;
pub mod wal;

pub use engine::StorageEngine;
pub use query::{Predicate, Query};
pub use record::{Document, Operation, OplogEntry};
pub use store::{DocumentStore, StoreError};
