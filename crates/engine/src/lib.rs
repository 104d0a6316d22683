//! meshdb-engine: the replication core.
//!
//! Owns the hybrid logical clock, the conflict resolvers, the merge
//! engine that folds remote oplog batches into the local store, and the
//! document API mutations enter through.

pub mod clock;
pub mod db;
pub mod merge;
pub mod resolver;

pub use clock::{HlcClock, ManualTimeSource, SystemTimeSource, TimeSource};
pub use db::{Database, DbError};
pub use merge::MergeEngine;
pub use resolver::{ConflictResolver, FieldMerge, LastWriteWins, ResolverError};
