//! The active side of anti-entropy.
//!
//! Every round the orchestrator samples a gossip fanout from the peer
//! directory, opens (or reuses) a session to each target, compares
//! clocks, and moves the oplog delta in whichever direction is behind.
//!
//! Scalar clock maxima alone cannot tell which entries two diverged
//! replicas are each missing, so the orchestrator keeps a per-peer
//! checkpoint: the timestamp up to which both logs are known to agree.
//! Deltas are exchanged relative to that checkpoint (duplicates are
//! harmless; the oplog append and the merge gate are idempotent), which
//! is what lets two sides of a healed partition trade their disjoint
//! histories in a single round.

use crate::message::{
    timestamp_from_parts, timestamp_to_parts, Message, PullChangesReq, PushChangesReq,
    WireOplogEntry,
};
use crate::session::{PeerChannel, Session, SessionOptions, SessionPool};
use crate::NetError;
use meshdb_cluster::{PeerDescriptor, PeerDirectory};
use meshdb_common::{HlcTimestamp, NodeId};
use meshdb_engine::Database;
use meshdb_storage::record::OplogEntry;
use meshdb_storage::store::DocumentStore;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Knobs for the orchestrator loop.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Time between anti-entropy rounds.
    pub interval: Duration,
    /// Peers contacted per round.
    pub fanout: usize,
    /// Session establishment and per-request options.
    pub session: SessionOptions,
    /// Entries per PushChangesReq when streaming a large delta.
    pub push_chunk: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            fanout: 3,
            session: SessionOptions::default(),
            push_chunk: 512,
        }
    }
}

/// What one `sync_with` accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncOutcome {
    /// Entries received and merged from the peer.
    pub pulled: usize,
    /// Entries streamed to the peer.
    pub pushed: usize,
}

impl SyncOutcome {
    pub fn is_noop(&self) -> bool {
        self.pulled == 0 && self.pushed == 0
    }
}

/// Periodically runs anti-entropy against sampled peers.
pub struct SyncOrchestrator<S: DocumentStore + 'static> {
    local_id: NodeId,
    db: Database<S>,
    directory: Arc<PeerDirectory>,
    pool: SessionPool,
    checkpoints: Mutex<HashMap<NodeId, HlcTimestamp>>,
    settings: OrchestratorSettings,
}

impl<S: DocumentStore + 'static> SyncOrchestrator<S> {
    pub fn new(
        local_id: NodeId,
        db: Database<S>,
        directory: Arc<PeerDirectory>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            local_id,
            db,
            directory,
            pool: SessionPool::new(),
            checkpoints: Mutex::new(HashMap::new()),
            settings,
        }
    }

    /// Spawn the periodic loop. Exits within one interval of
    /// cancellation; pooled sessions are dropped on the way out.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.settings.interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        self.run_round().await;
                    }
                }
            }
            self.pool.clear().await;
            tracing::debug!("sync orchestrator stopped");
        })
    }

    /// One anti-entropy round: sample the fanout and sync each target.
    /// Parallelism is naturally bounded by the fanout.
    pub async fn run_round(&self) {
        let peers = self.directory.snapshot().await;
        if peers.is_empty() {
            return;
        }
        meshdb_metrics::metrics().sync_rounds.inc();

        let count = self.settings.fanout.min(peers.len());
        let targets: Vec<PeerDescriptor> = peers
            .choose_multiple(&mut rand::thread_rng(), count)
            .cloned()
            .collect();

        let outcomes =
            futures::future::join_all(targets.iter().map(|peer| self.sync_with(peer))).await;

        for (peer, outcome) in targets.iter().zip(outcomes) {
            match outcome {
                Ok(outcome) if !outcome.is_noop() => {
                    tracing::debug!(
                        "synced with {}: pulled {}, pushed {}",
                        peer.node_id,
                        outcome.pulled,
                        outcome.pushed
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    meshdb_metrics::metrics().sync_failures.inc();
                    tracing::warn!("sync with {} failed: {}", peer.node_id, e);
                }
            }
        }
    }

    /// Sync against one peer. On any error the session is not returned
    /// to the pool, which closes the connection; the next round
    /// reconnects. The peer stays in the directory until its beacons
    /// expire.
    pub async fn sync_with(&self, peer: &PeerDescriptor) -> Result<SyncOutcome, NetError> {
        let mut session = match self.pool.take(&peer.node_id).await {
            Some(session) => session,
            None => {
                Session::connect(
                    &self.local_id,
                    peer.node_id.clone(),
                    peer.addr,
                    &self.settings.session,
                )
                .await?
            }
        };

        let outcome = self.exchange(&peer.node_id, &mut session).await;
        if outcome.is_ok() {
            self.pool.put(session).await;
        }
        outcome
    }

    async fn exchange<C: PeerChannel>(
        &self,
        peer: &NodeId,
        channel: &mut C,
    ) -> Result<SyncOutcome, NetError> {
        let remote_clock = match channel.request(&Message::GetClockReq).await? {
            Message::ClockRes(res) => {
                timestamp_from_parts(res.hlc_wall, res.hlc_logic, res.hlc_node)
            }
            other => {
                return Err(NetError::Protocol(format!(
                    "expected ClockRes, got {}",
                    other.msg_type().name()
                )));
            }
        };

        let local_clock = self.db.latest_timestamp().await?;
        let m = meshdb_metrics::metrics();

        // Equal clocks: both logs end at the same op, nothing to do. This
        // also seeds the checkpoint cheaply after a restart.
        if remote_clock == local_clock {
            self.advance_checkpoint(peer, local_clock).await;
            m.sync_noops.inc();
            return Ok(SyncOutcome::default());
        }

        let checkpoint = self.checkpoint(peer).await;

        // Snapshot our delta before pulling, so freshly received entries
        // are not echoed straight back to their sender.
        let local_delta = if local_clock > checkpoint {
            self.db.oplog_since(&checkpoint).await?
        } else {
            Vec::new()
        };

        let mut outcome = SyncOutcome::default();

        if remote_clock > checkpoint {
            outcome.pulled = self.pull(channel, &checkpoint).await?;
            m.sync_pulls.inc();
        }

        if !local_delta.is_empty() {
            outcome.pushed = self.push(channel, &local_delta).await?;
            m.sync_pushes.inc();
        }

        if outcome.is_noop() {
            m.sync_noops.inc();
        }

        // Both logs now agree up to the smaller of what each side held
        // going in. Conservative, and monotone by construction.
        let new_checkpoint = match (local_delta.is_empty(), remote_clock > checkpoint) {
            (true, true) => remote_clock,
            (false, false) => local_clock,
            (false, true) => local_clock.min(remote_clock),
            (true, false) => checkpoint,
        };
        self.advance_checkpoint(peer, new_checkpoint).await;

        Ok(outcome)
    }

    async fn pull<C: PeerChannel>(
        &self,
        channel: &mut C,
        since: &HlcTimestamp,
    ) -> Result<usize, NetError> {
        let (since_wall, since_logic, since_node) = timestamp_to_parts(since);
        let req = Message::PullChangesReq(PullChangesReq {
            since_wall,
            since_logic,
            since_node,
        });
        let entries = match channel.request(&req).await? {
            Message::ChangeSetRes(set) => {
                let entries: Result<Vec<OplogEntry>, NetError> = set
                    .entries
                    .into_iter()
                    .map(WireOplogEntry::into_entry)
                    .collect();
                entries?
            }
            other => {
                return Err(NetError::Protocol(format!(
                    "expected ChangeSetRes, got {}",
                    other.msg_type().name()
                )));
            }
        };
        let count = entries.len();
        self.db.apply_remote(entries).await?;
        Ok(count)
    }

    async fn push<C: PeerChannel>(
        &self,
        channel: &mut C,
        entries: &[OplogEntry],
    ) -> Result<usize, NetError> {
        for chunk in entries.chunks(self.settings.push_chunk) {
            let req = Message::PushChangesReq(PushChangesReq {
                entries: chunk.iter().map(WireOplogEntry::from).collect(),
            });
            match channel.request(&req).await? {
                Message::AckRes(ack) if ack.success => {}
                Message::AckRes(_) => {
                    return Err(NetError::Db("peer rejected pushed changes".into()));
                }
                other => {
                    return Err(NetError::Protocol(format!(
                        "expected AckRes, got {}",
                        other.msg_type().name()
                    )));
                }
            }
        }
        Ok(entries.len())
    }

    async fn checkpoint(&self, peer: &NodeId) -> HlcTimestamp {
        self.checkpoints
            .lock()
            .await
            .get(peer)
            .cloned()
            .unwrap_or_else(HlcTimestamp::zero)
    }

    async fn advance_checkpoint(&self, peer: &NodeId, candidate: HlcTimestamp) {
        let mut checkpoints = self.checkpoints.lock().await;
        let entry = checkpoints
            .entry(peer.clone())
            .or_insert_with(HlcTimestamp::zero);
        if candidate > *entry {
            *entry = candidate;
        }
    }

    /// Number of pooled (idle, ready) sessions. For tests and stats.
    pub async fn pooled_sessions(&self) -> usize {
        self.pool.len().await
    }
}

impl<S: DocumentStore + 'static> std::fmt::Debug for SyncOrchestrator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("local_id", &self.local_id)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
