//! meshdb-node: entry point for a meshdb peer.
//!
//! Loads config, establishes the node identity, opens storage, wires the
//! replication engine, discovery, server, and orchestrator into one
//! dependency graph, then runs until Ctrl+C. Shutdown is ordered: the
//! orchestrator stops initiating rounds first, then discovery stops
//! advertising and listening, then the server closes its listener.

use meshdb_cluster::{DiscoveryService, DiscoverySettings, PeerDirectory};
use meshdb_common::{NodeId, NodeIdentity};
use meshdb_engine::{ConflictResolver, Database, FieldMerge, HlcClock, LastWriteWins};
use meshdb_net::{
    OrchestratorSettings, ServerSettings, SessionOptions, SyncOrchestrator, SyncServer,
};
use meshdb_storage::engine::StorageEngine;
use meshdb_storage::wal::FsyncPolicy;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Read the persisted node id from the data directory, creating a fresh
/// one on first start. A stable id keeps HLC node components consistent
/// across restarts.
fn load_or_create_node_id(data_dir: &Path) -> std::io::Result<NodeId> {
    let path = data_dir.join("node_id");
    match std::fs::read_to_string(&path) {
        Ok(raw) => Ok(NodeId::from(raw.trim())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            std::fs::create_dir_all(data_dir)?;
            let id = NodeId::generate();
            std::fs::write(&path, id.as_str())?;
            Ok(id)
        }
        Err(e) => Err(e),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    meshdb_metrics::init_tracing();

    // Load config: first CLI arg is the YAML config path
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());

    let config = meshdb_config::load_from_file(Path::new(&config_path)).unwrap_or_else(|e| {
        tracing::warn!(
            "failed to load config from {}: {}, using defaults",
            config_path,
            e
        );
        meshdb_config::NodeConfig::default()
    });

    let mut identity = NodeIdentity::new(load_or_create_node_id(&config.storage.data_dir)?);
    if let Some(token) = &config.security.auth_token {
        identity = identity.with_auth_token(token.clone());
        if config.security.secure {
            identity = identity.with_secret(token.clone());
        }
    }
    let node_id = identity.node_id.clone();
    tracing::info!("node {} starting", node_id);

    // Open storage and wire the engine.
    let fsync = FsyncPolicy::from_str_config(&config.storage.fsync);
    let engine = StorageEngine::open(&config.storage.data_dir, fsync)?;
    let store = Arc::new(RwLock::new(engine));
    let clock = Arc::new(HlcClock::new(node_id.clone()));
    let resolver: Arc<dyn ConflictResolver> = match config.resolver.as_str() {
        "field-merge" => Arc::new(FieldMerge),
        _ => Arc::new(LastWriteWins),
    };
    let db = Database::open(store, clock, resolver).await?;

    let directory = Arc::new(PeerDirectory::new(
        node_id.clone(),
        Duration::from_secs(config.discovery.peer_ttl_secs),
    ));

    let server_cancel = CancellationToken::new();
    let discovery_cancel = CancellationToken::new();
    let orchestrator_cancel = CancellationToken::new();

    // Sync server. A bind failure is fatal.
    let server = SyncServer::new(
        node_id.clone(),
        db.clone(),
        ServerSettings {
            auth_token: identity.auth_token.clone(),
            secure: config.security.secure,
            compression: config.sync.compression,
            compression_threshold: config.sync.compression_threshold,
        },
    );
    let listen: SocketAddr = format!("0.0.0.0:{}", config.tcp_port).parse()?;
    let (addr, server_handle) = server.bind(listen, server_cancel.clone()).await?;
    tracing::info!("accepting sync connections on {}", addr);

    // Discovery: sweeper, beacon emitter, beacon listener.
    let sweeper_handle = directory.clone().spawn_sweeper(
        Duration::from_secs(config.discovery.sweep_interval_secs),
        discovery_cancel.clone(),
    );
    let discovery = DiscoveryService::spawn(
        node_id.clone(),
        config.tcp_port,
        directory.clone(),
        DiscoverySettings {
            udp_port: config.discovery.udp_port,
            beacon_interval: Duration::from_secs(config.discovery.beacon_interval_secs),
            loopback_override: config.discovery.loopback_override,
        },
        discovery_cancel.clone(),
    )
    .await?;

    // Anti-entropy orchestrator.
    let orchestrator = Arc::new(SyncOrchestrator::new(
        node_id,
        db,
        directory,
        OrchestratorSettings {
            interval: Duration::from_secs(config.sync.interval_secs),
            fanout: config.sync.fanout,
            session: SessionOptions {
                auth_token: identity.auth_token.clone().unwrap_or_default(),
                secure: config.security.secure,
                compression: config.sync.compression,
                compression_threshold: config.sync.compression_threshold,
                timeout: Duration::from_millis(config.sync.request_timeout_ms),
            },
            push_chunk: 512,
        },
    ));
    let orchestrator_handle = orchestrator.spawn(orchestrator_cancel.clone());

    // Metrics endpoint, if configured.
    if let Some(metrics_port) = config.metrics_port {
        let metrics_addr: SocketAddr = format!("0.0.0.0:{}", metrics_port).parse()?;
        tokio::spawn(async move {
            if let Err(e) = meshdb_metrics::serve_metrics(metrics_addr).await {
                tracing::warn!("metrics server failed: {}", e);
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("received Ctrl+C, shutting down");

    // Ordered shutdown: stop initiating rounds, then stop advertising
    // and listening for beacons, then close the sync listener.
    orchestrator_cancel.cancel();
    let _ = orchestrator_handle.await;

    discovery_cancel.cancel();
    discovery.join().await;
    let _ = sweeper_handle.await;

    server_cancel.cancel();
    let _ = server_handle.await;

    tracing::info!("shutdown complete");
    Ok(())
}
