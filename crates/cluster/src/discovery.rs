//! UDP beacon discovery.
//!
//! Every node broadcasts a small JSON beacon on a well-known UDP port and
//! listens for everyone else's. The beacon payload uses snake_case field
//! names; changing them breaks interop with existing deployments.

use crate::directory::PeerDirectory;
use meshdb_common::NodeId;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("discovery socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// The on-wire beacon. snake_case names are mandatory for interop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Beacon {
    pub node_id: String,
    pub tcp_port: u16,
}

/// Knobs for the discovery tasks.
#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub udp_port: u16,
    pub beacon_interval: Duration,
    /// Substitute 127.0.0.1 for the beacon sender address (single-host
    /// deployments).
    pub loopback_override: bool,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            udp_port: 5000,
            beacon_interval: Duration::from_secs(5),
            loopback_override: false,
        }
    }
}

/// Handles for the emitter and listener tasks.
#[derive(Debug)]
pub struct DiscoveryService {
    emitter: tokio::task::JoinHandle<()>,
    listener: tokio::task::JoinHandle<()>,
}

impl DiscoveryService {
    /// Bind sockets and spawn both tasks. Fails only if the listener
    /// port cannot be bound; emit errors later are logged and skipped.
    pub async fn spawn(
        local_id: NodeId,
        tcp_port: u16,
        directory: Arc<PeerDirectory>,
        settings: DiscoverySettings,
        cancel: CancellationToken,
    ) -> Result<Self, DiscoveryError> {
        let listen_socket = bind_reusable(settings.udp_port)?;
        let emit_socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        emit_socket.set_broadcast(true)?;

        let beacon = Beacon {
            node_id: local_id.as_str().to_string(),
            tcp_port,
        };

        let emitter = tokio::spawn(emit_loop(
            emit_socket,
            beacon.clone(),
            settings.clone(),
            cancel.clone(),
        ));
        let listener = tokio::spawn(listen_loop(
            listen_socket,
            local_id,
            directory,
            settings,
            cancel,
        ));

        Ok(Self { emitter, listener })
    }

    /// Wait for both tasks to finish (after cancellation).
    pub async fn join(self) {
        let _ = self.emitter.await;
        let _ = self.listener.await;
    }
}

/// Bind the shared discovery port with SO_REUSEADDR so several nodes on
/// one host can all listen.
fn bind_reusable(port: u16) -> Result<UdpSocket, std::io::Error> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    let addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, port).into();
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

async fn emit_loop(
    socket: UdpSocket,
    beacon: Beacon,
    settings: DiscoverySettings,
    cancel: CancellationToken,
) {
    // Beacons are tiny; encode once.
    let payload = match serde_json::to_vec(&beacon) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!("beacon encode failed, discovery disabled: {}", e);
            return;
        }
    };
    let target = SocketAddr::from((Ipv4Addr::BROADCAST, settings.udp_port));

    let mut tick = tokio::time::interval(settings.beacon_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                match socket.send_to(&payload, target).await {
                    Ok(_) => meshdb_metrics::metrics().beacons_sent.inc(),
                    Err(e) => tracing::warn!("beacon broadcast failed: {}", e),
                }
            }
        }
    }
    tracing::debug!("beacon emitter stopped");
}

async fn listen_loop(
    socket: UdpSocket,
    local_id: NodeId,
    directory: Arc<PeerDirectory>,
    settings: DiscoverySettings,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; 512];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            recv = socket.recv_from(&mut buf) => {
                match recv {
                    Ok((len, src)) => {
                        handle_beacon(&buf[..len], src, &local_id, &directory, settings.loopback_override).await;
                    }
                    Err(e) => {
                        tracing::warn!("beacon receive failed: {}", e);
                    }
                }
            }
        }
    }
    tracing::debug!("beacon listener stopped");
}

/// Parse one datagram and update the directory. Malformed beacons and
/// our own echoes are dropped.
async fn handle_beacon(
    payload: &[u8],
    src: SocketAddr,
    local_id: &NodeId,
    directory: &PeerDirectory,
    loopback_override: bool,
) {
    let beacon: Beacon = match serde_json::from_slice(payload) {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!("malformed beacon from {}: {}", src, e);
            return;
        }
    };

    if beacon.node_id == local_id.as_str() {
        return; // our own broadcast echoed back
    }
    meshdb_metrics::metrics().beacons_received.inc();

    let ip = if loopback_override {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        src.ip()
    };
    let addr = SocketAddr::new(ip, beacon.tcp_port);
    directory.upsert(NodeId::from(beacon.node_id), addr).await;
}
