//! The peer directory: every node we currently believe is alive.

use meshdb_common::NodeId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// A known peer. Lives only in memory; rebuilt from beacons after a
/// restart.
#[derive(Debug, Clone)]
pub struct PeerDescriptor {
    pub node_id: NodeId,
    pub addr: SocketAddr,
    pub last_seen: Instant,
}

/// Thread-safe membership map. The local node is never inserted.
#[derive(Debug)]
pub struct PeerDirectory {
    local: NodeId,
    ttl: Duration,
    peers: RwLock<HashMap<NodeId, PeerDescriptor>>,
}

impl PeerDirectory {
    pub fn new(local: NodeId, ttl: Duration) -> Self {
        Self {
            local,
            ttl,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or refresh a peer. Beacons from ourselves are dropped by
    /// the discovery listener, but guard here as well.
    pub async fn upsert(&self, node_id: NodeId, addr: SocketAddr) {
        if node_id == self.local {
            return;
        }
        let mut peers = self.peers.write().await;
        match peers.get_mut(&node_id) {
            Some(peer) => {
                peer.addr = addr;
                peer.last_seen = Instant::now();
            }
            None => {
                tracing::info!("peer {} discovered at {}", node_id, addr);
                peers.insert(
                    node_id.clone(),
                    PeerDescriptor {
                        node_id,
                        addr,
                        last_seen: Instant::now(),
                    },
                );
                meshdb_metrics::metrics().peers_alive.set(peers.len() as i64);
            }
        }
    }

    /// An independent copy for readers (the orchestrator samples this).
    pub async fn snapshot(&self) -> Vec<PeerDescriptor> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    /// Evict peers whose last beacon is older than the TTL. Returns the
    /// number evicted.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut peers = self.peers.write().await;
        let before = peers.len();
        peers.retain(|id, peer| {
            let alive = now.duration_since(peer.last_seen) <= self.ttl;
            if !alive {
                tracing::info!("peer {} expired ({}s without a beacon)", id, self.ttl.as_secs());
            }
            alive
        });
        meshdb_metrics::metrics().peers_alive.set(peers.len() as i64);
        before - peers.len()
    }

    /// Run `sweep` every `interval` until cancelled.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let dir = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        dir.sweep().await;
                    }
                }
            }
        })
    }
}
