//! meshdb-common: shared types for the meshdb project.
//!
//! Provides the stable `NodeId` and the `HlcTimestamp` hybrid logical
//! clock value that orders every mutation in the system.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

// ---------------------------------------------------------------------------
// NodeId
// ---------------------------------------------------------------------------

/// A node's stable identifier within the cluster.
///
/// Opaque string, unique per node, generated once and persisted so that
/// HLC node components stay stable across restarts. Participates in HLC
/// tie-breaking via lexicographic comparison.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create a `NodeId` from an existing string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random `NodeId` (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The empty id, used only inside the zero `HlcTimestamp`.
    pub fn empty() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Show a short prefix for readability; full ids are long UUIDs.
        if self.0.len() > 8 {
            write!(f, "{}…", &self.0[..8])
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// HlcTimestamp
// ---------------------------------------------------------------------------

/// A hybrid logical clock value: wall-clock milliseconds, a logical
/// tie-breaker, and the issuing node's id.
///
/// Total order: `wall`, then `logical`, then `node` lexicographically.
/// The zero value `(0, 0, "")` means "no information" and sorts before
/// every real timestamp.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct HlcTimestamp {
    /// Milliseconds since the Unix epoch at issue time.
    pub wall: i64,
    /// Monotonic counter distinguishing events within one millisecond.
    pub logical: i32,
    /// Issuing node, the final tie-breaker.
    pub node: NodeId,
}

impl HlcTimestamp {
    pub const fn zero() -> Self {
        Self {
            wall: 0,
            logical: 0,
            node: NodeId(String::new()),
        }
    }

    pub fn new(wall: i64, logical: i32, node: NodeId) -> Self {
        Self { wall, logical, node }
    }

    /// True for the zero value.
    pub fn is_zero(&self) -> bool {
        self.wall == 0 && self.logical == 0 && self.node.is_empty()
    }

    /// The `(wall, logical)` pair used as the oplog sort key.
    pub fn sort_key(&self) -> (i64, i32) {
        (self.wall, self.logical)
    }
}

impl Ord for HlcTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.wall
            .cmp(&other.wall)
            .then_with(|| self.logical.cmp(&other.logical))
            .then_with(|| self.node.cmp(&other.node))
    }
}

impl PartialOrd for HlcTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for HlcTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}@{}", self.wall, self.logical, self.node)
    }
}

impl fmt::Debug for HlcTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hlc({})", self)
    }
}

// ---------------------------------------------------------------------------
// NodeIdentity
// ---------------------------------------------------------------------------

/// Process-wide identity established at startup.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub node_id: NodeId,
    /// Shared cluster secret for the secure channel, if configured.
    pub secret: Option<String>,
    /// Cluster auth token presented during handshakes.
    pub auth_token: Option<String>,
}

impl NodeIdentity {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            secret: None,
            auth_token: None,
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
