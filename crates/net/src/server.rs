//! The passive side of the sync protocol.
//!
//! One accept loop, one handler task per connection, strictly sequential
//! request/response within a connection. A malformed frame, unknown
//! type, or handler error closes that connection only; the server never
//! initiates a message.

use crate::message::{
    timestamp_from_parts, timestamp_to_parts, AckRes, ClockRes, HandshakeRes, Message,
    WireOplogEntry,
};
use crate::secure::EphemeralKeys;
use crate::session::{recv_message, send_message, COMPRESSION_BROTLI, COMPRESSION_NONE};
use crate::NetError;
use meshdb_common::NodeId;
use meshdb_engine::Database;
use meshdb_storage::record::OplogEntry;
use meshdb_storage::store::DocumentStore;
use std::net::SocketAddr;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Server-side protocol settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Shared cluster secret; `None` means an open cluster.
    pub auth_token: Option<String>,
    /// Require the encrypted envelope. Secure and plaintext clusters do
    /// not interoperate.
    pub secure: bool,
    /// Offer Brotli compression during handshakes.
    pub compression: bool,
    pub compression_threshold: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            auth_token: None,
            secure: false,
            compression: true,
            compression_threshold: 1024,
        }
    }
}

/// The sync server: answers clock/pull/push requests from peers.
pub struct SyncServer<S: DocumentStore + 'static> {
    inner: Arc<Inner<S>>,
}

struct Inner<S: DocumentStore> {
    node_id: NodeId,
    db: Database<S>,
    settings: ServerSettings,
}

impl<S: DocumentStore + 'static> Clone for SyncServer<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: DocumentStore + 'static> SyncServer<S> {
    pub fn new(node_id: NodeId, db: Database<S>, settings: ServerSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                node_id,
                db,
                settings,
            }),
        }
    }

    /// Bind the listener and spawn the accept loop. A bind failure is
    /// fatal and is returned to the caller.
    pub async fn bind(
        &self,
        addr: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), NetError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("sync server listening on {}", local_addr);

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer_addr)) => {
                                let inner = inner.clone();
                                let conn_cancel = cancel.clone();
                                tokio::spawn(async move {
                                    if let Err(e) =
                                        handle_connection(inner, stream, peer_addr, conn_cancel).await
                                    {
                                        tracing::debug!(
                                            "connection from {} closed: {}",
                                            peer_addr,
                                            e
                                        );
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::warn!("accept failed: {}", e);
                            }
                        }
                    }
                }
            }
            tracing::debug!("sync server accept loop stopped");
        });

        Ok((local_addr, handle))
    }
}

impl<S: DocumentStore + 'static> std::fmt::Debug for SyncServer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncServer")
            .field("node_id", &self.inner.node_id)
            .finish_non_exhaustive()
    }
}

/// Constant-time auth token check.
fn token_matches(expected: Option<&str>, presented: &str) -> bool {
    match expected {
        None => true,
        Some(exp) => exp.as_bytes().ct_eq(presented.as_bytes()).into(),
    }
}

async fn handle_connection<S: DocumentStore>(
    inner: Arc<Inner<S>>,
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    cancel: CancellationToken,
) -> Result<(), NetError> {
    stream.set_nodelay(true)?;

    // First frame must be the handshake; it travels in plaintext.
    let req = match recv_message(&mut stream, None).await? {
        Message::HandshakeReq(req) => req,
        other => {
            return Err(NetError::Protocol(format!(
                "expected handshake, got {}",
                other.msg_type().name()
            )));
        }
    };

    let token_ok = token_matches(inner.settings.auth_token.as_deref(), &req.auth_token);
    // Mode mismatch is an authentication failure per the cluster policy:
    // a secure node rejects plaintext handshakes and vice versa.
    let mode_ok = inner.settings.secure == req.public_key.is_some();

    if !token_ok || !mode_ok {
        meshdb_metrics::metrics().handshake_failures.inc();
        tracing::warn!(
            "rejecting handshake from {} ({}): token_ok={}, mode_ok={}",
            req.node_id,
            peer_addr,
            token_ok,
            mode_ok
        );
        let res = Message::HandshakeRes(HandshakeRes {
            node_id: inner.node_id.as_str().to_string(),
            accepted: false,
            selected_compression: COMPRESSION_NONE.to_string(),
            public_key: None,
        });
        send_message(&mut stream, &res, None, false, usize::MAX).await?;
        return Ok(());
    }

    let selected = if inner.settings.compression
        && req
            .supported_compression
            .iter()
            .any(|c| c == COMPRESSION_BROTLI)
    {
        COMPRESSION_BROTLI
    } else {
        COMPRESSION_NONE
    };

    // In secure mode, answer with our ephemeral key and derive the
    // session channel before the first data exchange.
    let (secure, res_key) = match req.public_key {
        Some(client_pub) => {
            let keys = EphemeralKeys::generate();
            let server_pub = keys.public_bytes().to_vec();
            (Some(keys.agree(&client_pub)?), Some(server_pub))
        }
        None => (None, None),
    };

    let res = Message::HandshakeRes(HandshakeRes {
        node_id: inner.node_id.as_str().to_string(),
        accepted: true,
        selected_compression: selected.to_string(),
        public_key: res_key,
    });
    send_message(&mut stream, &res, None, false, usize::MAX).await?;

    let compress = selected == COMPRESSION_BROTLI;
    tracing::debug!(
        "peer {} connected from {} (compression: {}, secure: {})",
        req.node_id,
        peer_addr,
        selected,
        secure.is_some()
    );

    // Request/response loop: one in, one out.
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = recv_message(&mut stream, secure.as_ref()) => msg?,
        };

        let _timer = meshdb_metrics::start_request_timer(msg.msg_type().name(), "inbound");
        let response = dispatch(&inner, msg).await?;
        send_message(
            &mut stream,
            &response,
            secure.as_ref(),
            compress,
            inner.settings.compression_threshold,
        )
        .await?;
    }

    Ok(())
}

/// Map one request to its response. Unknown or out-of-place messages are
/// protocol violations and terminate the connection.
async fn dispatch<S: DocumentStore>(
    inner: &Inner<S>,
    msg: Message,
) -> Result<Message, NetError> {
    match msg {
        Message::GetClockReq => {
            let max = inner.db.latest_timestamp().await?;
            let (hlc_wall, hlc_logic, hlc_node) = timestamp_to_parts(&max);
            Ok(Message::ClockRes(ClockRes {
                hlc_wall,
                hlc_logic,
                hlc_node,
            }))
        }
        Message::PullChangesReq(req) => {
            let since = timestamp_from_parts(req.since_wall, req.since_logic, req.since_node);
            let entries = inner.db.oplog_since(&since).await?;
            Ok(Message::ChangeSetRes(crate::message::ChangeSetRes {
                entries: entries.iter().map(WireOplogEntry::from).collect(),
            }))
        }
        Message::PushChangesReq(req) => {
            let entries: Result<Vec<OplogEntry>, NetError> = req
                .entries
                .into_iter()
                .map(WireOplogEntry::into_entry)
                .collect();
            let entries = entries?;
            let success = match inner.db.apply_remote(entries).await {
                Ok(()) => true,
                Err(e) => {
                    // Store errors roll the batch back; report failure and
                    // let the peer retry next round.
                    tracing::warn!("push merge failed: {}", e);
                    false
                }
            };
            Ok(Message::AckRes(AckRes { success }))
        }
        other => Err(NetError::Protocol(format!(
            "unexpected {} on an established session",
            other.msg_type().name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PushChangesReq;
    use crate::session::{Session, SessionOptions};
    use meshdb_common::HlcTimestamp;
    use meshdb_engine::{HlcClock, LastWriteWins};
    use meshdb_storage::engine::StorageEngine;
    use meshdb_storage::wal::FsyncPolicy;
    use tempfile::TempDir;
    use tokio::sync::RwLock;

    struct TestServer {
        addr: SocketAddr,
        db: Database<StorageEngine>,
        cancel: CancellationToken,
        _dir: TempDir,
    }

    async fn spawn_server(settings: ServerSettings) -> TestServer {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path(), FsyncPolicy::None).unwrap();
        let clock = Arc::new(HlcClock::new(NodeId::from("server")));
        let db = Database::open(
            Arc::new(RwLock::new(engine)),
            clock,
            Arc::new(LastWriteWins),
        )
        .await
        .unwrap();

        let server = SyncServer::new(NodeId::from("server"), db.clone(), settings);
        let cancel = CancellationToken::new();
        let (addr, _handle) = server
            .bind("127.0.0.1:0".parse().unwrap(), cancel.clone())
            .await
            .unwrap();

        TestServer {
            addr,
            db,
            cancel,
            _dir: dir,
        }
    }

    fn wire_put(key: &str, wall: i64, node: &str) -> WireOplogEntry {
        WireOplogEntry {
            collection: "c".into(),
            key: key.into(),
            operation: "Put".into(),
            json_data: r#"{"v":1}"#.into(),
            hlc_wall: wall,
            hlc_logic: 0,
            hlc_node: node.into(),
        }
    }

    #[tokio::test]
    async fn test_handshake_and_clock_exchange() {
        let server = spawn_server(ServerSettings::default()).await;

        let mut session = Session::connect(
            &NodeId::from("client"),
            NodeId::from("server"),
            server.addr,
            &SessionOptions::default(),
        )
        .await
        .unwrap();

        let res = session.request(&Message::GetClockReq).await.unwrap();
        match res {
            Message::ClockRes(clock) => {
                assert_eq!(clock.hlc_wall, 0, "fresh server reports the zero clock");
            }
            other => panic!("expected ClockRes, got {:?}", other),
        }

        server.cancel.cancel();
    }

    #[tokio::test]
    async fn test_push_then_pull() {
        let server = spawn_server(ServerSettings::default()).await;
        let mut session = Session::connect(
            &NodeId::from("client"),
            NodeId::from("server"),
            server.addr,
            &SessionOptions::default(),
        )
        .await
        .unwrap();

        let push = Message::PushChangesReq(PushChangesReq {
            entries: vec![wire_put("k1", 100, "client")],
        });
        match session.request(&push).await.unwrap() {
            Message::AckRes(ack) => assert!(ack.success),
            other => panic!("expected AckRes, got {:?}", other),
        }

        // The server's document state reflects the push.
        let doc = server.db.get("c", "k1").await.unwrap().unwrap();
        assert_eq!(doc.body.as_deref(), Some(r#"{"v":1}"#));

        // Pull from zero returns the entry back.
        let pull = Message::PullChangesReq(crate::message::PullChangesReq {
            since_wall: 0,
            since_logic: 0,
            since_node: String::new(),
        });
        match session.request(&pull).await.unwrap() {
            Message::ChangeSetRes(set) => {
                assert_eq!(set.entries.len(), 1);
                assert_eq!(set.entries[0].key, "k1");
            }
            other => panic!("expected ChangeSetRes, got {:?}", other),
        }

        server.cancel.cancel();
    }

    #[tokio::test]
    async fn test_auth_rejection() {
        let server = spawn_server(ServerSettings {
            auth_token: Some("cluster-secret".into()),
            ..ServerSettings::default()
        })
        .await;

        let err = Session::connect(
            &NodeId::from("client"),
            NodeId::from("server"),
            server.addr,
            &SessionOptions {
                auth_token: "wrong".into(),
                ..SessionOptions::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, NetError::Rejected(_)));

        server.cancel.cancel();
    }

    #[tokio::test]
    async fn test_auth_accepts_matching_token() {
        let server = spawn_server(ServerSettings {
            auth_token: Some("cluster-secret".into()),
            ..ServerSettings::default()
        })
        .await;

        let session = Session::connect(
            &NodeId::from("client"),
            NodeId::from("server"),
            server.addr,
            &SessionOptions {
                auth_token: "cluster-secret".into(),
                ..SessionOptions::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(session.state(), crate::session::SessionState::Ready);

        server.cancel.cancel();
    }

    #[tokio::test]
    async fn test_secure_server_rejects_plaintext_client() {
        let server = spawn_server(ServerSettings {
            auth_token: Some("s".into()),
            secure: true,
            ..ServerSettings::default()
        })
        .await;

        let err = Session::connect(
            &NodeId::from("client"),
            NodeId::from("server"),
            server.addr,
            &SessionOptions {
                auth_token: "s".into(),
                secure: false,
                ..SessionOptions::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, NetError::Rejected(_)));

        server.cancel.cancel();
    }

    #[tokio::test]
    async fn test_plaintext_server_rejects_secure_client() {
        let server = spawn_server(ServerSettings::default()).await;

        let err = Session::connect(
            &NodeId::from("client"),
            NodeId::from("server"),
            server.addr,
            &SessionOptions {
                secure: true,
                ..SessionOptions::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, NetError::Rejected(_)));

        server.cancel.cancel();
    }

    #[tokio::test]
    async fn test_secure_end_to_end_exchange() {
        let server = spawn_server(ServerSettings {
            auth_token: Some("s".into()),
            secure: true,
            ..ServerSettings::default()
        })
        .await;

        let mut session = Session::connect(
            &NodeId::from("client"),
            NodeId::from("server"),
            server.addr,
            &SessionOptions {
                auth_token: "s".into(),
                secure: true,
                ..SessionOptions::default()
            },
        )
        .await
        .unwrap();

        let push = Message::PushChangesReq(PushChangesReq {
            entries: vec![wire_put("sk", 7, "client")],
        });
        match session.request(&push).await.unwrap() {
            Message::AckRes(ack) => assert!(ack.success),
            other => panic!("expected AckRes, got {:?}", other),
        }

        let doc = server.db.get("c", "sk").await.unwrap().unwrap();
        assert_eq!(doc.updated_at, HlcTimestamp::new(7, 0, NodeId::from("client")));

        server.cancel.cancel();
    }

    #[tokio::test]
    async fn test_malformed_push_closes_connection_only() {
        let server = spawn_server(ServerSettings::default()).await;
        let mut session = Session::connect(
            &NodeId::from("client"),
            NodeId::from("server"),
            server.addr,
            &SessionOptions::default(),
        )
        .await
        .unwrap();

        // Unknown operation string is a protocol violation.
        let mut bad = wire_put("k", 1, "client");
        bad.operation = "Frobnicate".into();
        let push = Message::PushChangesReq(PushChangesReq { entries: vec![bad] });
        assert!(session.request(&push).await.is_err());

        // A fresh connection still works.
        let mut session2 = Session::connect(
            &NodeId::from("client"),
            NodeId::from("server"),
            server.addr,
            &SessionOptions::default(),
        )
        .await
        .unwrap();
        assert!(session2.request(&Message::GetClockReq).await.is_ok());

        server.cancel.cancel();
    }

    #[test]
    fn test_token_matches_constant_time_paths() {
        assert!(token_matches(None, "anything"));
        assert!(token_matches(Some("abc"), "abc"));
        assert!(!token_matches(Some("abc"), "abd"));
        assert!(!token_matches(Some("abc"), "ab"));
        assert!(!token_matches(Some("abc"), ""));
    }
}
