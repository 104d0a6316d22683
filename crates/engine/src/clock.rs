//! The node-wide hybrid logical clock.
//!
//! One mutex guards the current value; `tick` and `observe` are the only
//! mutators, so successive ticks are strictly monotonic even when the
//! system wall clock stalls or jumps backwards.

use meshdb_common::{HlcTimestamp, NodeId};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall-clock milliseconds. Abstracted so tests can drive the
/// clock deterministically.
pub trait TimeSource: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// The real system clock.
#[derive(Debug, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// A hand-driven time source for tests.
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    now: AtomicI64,
}

impl ManualTimeSource {
    pub fn at(millis: i64) -> Self {
        Self {
            now: AtomicI64::new(millis),
        }
    }

    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// The process-wide HLC generator for one node.
pub struct HlcClock {
    node: NodeId,
    cur: Mutex<HlcTimestamp>,
    time: Arc<dyn TimeSource>,
}

impl HlcClock {
    pub fn new(node: NodeId) -> Self {
        Self::with_time_source(node, Arc::new(SystemTimeSource))
    }

    pub fn with_time_source(node: NodeId, time: Arc<dyn TimeSource>) -> Self {
        Self {
            node,
            cur: Mutex::new(HlcTimestamp::zero()),
            time,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node
    }

    /// Issue a new timestamp for a local event. Strictly greater than
    /// every timestamp previously returned or observed.
    pub fn tick(&self) -> HlcTimestamp {
        let mut cur = self.cur.lock().expect("hlc mutex poisoned");
        let phys = self.time.now_millis();
        if phys > cur.wall {
            *cur = HlcTimestamp::new(phys, 0, self.node.clone());
        } else {
            // Wall clock stalled or regressed: the logical counter keeps
            // the sequence strictly increasing.
            *cur = HlcTimestamp::new(cur.wall, cur.logical + 1, self.node.clone());
        }
        cur.clone()
    }

    /// Fold a remote timestamp into the clock so later local ticks stay
    /// ahead of received causality. Standard HLC receive rule.
    pub fn observe(&self, remote: &HlcTimestamp) {
        let mut cur = self.cur.lock().expect("hlc mutex poisoned");
        let phys = self.time.now_millis();
        let wall = cur.wall.max(remote.wall).max(phys);

        let logical = if wall == cur.wall && wall == remote.wall {
            cur.logical.max(remote.logical) + 1
        } else if wall == cur.wall {
            cur.logical + 1
        } else if wall == remote.wall {
            remote.logical + 1
        } else {
            0
        };

        *cur = HlcTimestamp::new(wall, logical, self.node.clone());
    }

    /// A snapshot of the current value (does not advance the clock).
    pub fn current(&self) -> HlcTimestamp {
        self.cur.lock().expect("hlc mutex poisoned").clone()
    }
}

impl std::fmt::Debug for HlcClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HlcClock")
            .field("node", &self.node)
            .field("cur", &self.current())
            .finish()
    }
}
