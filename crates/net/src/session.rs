//! Client-side sync sessions and the session pool.
//!
//! A session is an authenticated, optionally encrypted, long-lived TCP
//! connection. The pool hands a session to at most one task at a time:
//! `take` removes it from the map and `put` returns it, so two exchanges
//! can never interleave on one connection.

use crate::frame::{maybe_compress, maybe_decompress, read_frame, write_frame};
use crate::message::{HandshakeReq, Message, MessageType};
use crate::secure::{EphemeralKeys, SecureChannel};
use crate::NetError;
use meshdb_common::NodeId;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Duration;

pub const COMPRESSION_BROTLI: &str = "brotli";
pub const COMPRESSION_NONE: &str = "none";

/// Session lifecycle. Only `Ready` accepts data exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Connecting,
    Handshaking,
    Ready,
    Closed,
    Failed,
}

/// Knobs for establishing sessions.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub auth_token: String,
    pub secure: bool,
    pub compression: bool,
    pub compression_threshold: usize,
    pub timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            auth_token: String::new(),
            secure: false,
            compression: true,
            compression_threshold: 1024,
            timeout: Duration::from_secs(5),
        }
    }
}

// ---------------------------------------------------------------------------
// Message transport (shared with the server side)
// ---------------------------------------------------------------------------

/// Encode, optionally compress, optionally seal, and write one message.
pub async fn send_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Message,
    secure: Option<&SecureChannel>,
    compress: bool,
    threshold: usize,
) -> Result<(), NetError> {
    let msg_type = msg.msg_type();
    let payload = msg.encode_payload()?;
    let (flags, payload) = maybe_compress(payload, compress, threshold);

    meshdb_metrics::metrics()
        .msgs_sent_by_type
        .with_label_values(&[msg_type.name()])
        .inc();

    match secure {
        Some(channel) => {
            let env = channel.seal(msg_type as u8, flags, &payload)?;
            let env_payload = Message::SecureEnv(env).encode_payload()?;
            write_frame(writer, MessageType::SecureEnv, 0, &env_payload).await
        }
        None => write_frame(writer, msg_type, flags, &payload).await,
    }
}

/// Read, unseal, decompress, and decode one message.
pub async fn recv_message<R: AsyncRead + Unpin>(
    reader: &mut R,
    secure: Option<&SecureChannel>,
) -> Result<Message, NetError> {
    let frame = read_frame(reader).await?;

    let msg = match (secure, frame.msg_type) {
        (Some(channel), MessageType::SecureEnv) => {
            let env = match Message::decode(MessageType::SecureEnv, &frame.payload)? {
                Message::SecureEnv(env) => env,
                _ => unreachable!("decode of SecureEnv tag yields SecureEnv"),
            };
            let (inner_type, flags, payload) = channel.open(&env)?;
            let inner_type = MessageType::from_u8(inner_type)?;
            let payload = maybe_decompress(flags, payload)?;
            Message::decode(inner_type, &payload)?
        }
        (Some(_), other) => {
            return Err(NetError::Protocol(format!(
                "expected secure envelope, got {}",
                other.name()
            )));
        }
        (None, MessageType::SecureEnv) => {
            return Err(NetError::Protocol(
                "secure envelope on a plaintext session".into(),
            ));
        }
        (None, _) => {
            let payload = maybe_decompress(frame.flags, frame.payload)?;
            Message::decode(frame.msg_type, &payload)?
        }
    };

    meshdb_metrics::metrics()
        .msgs_received_by_type
        .with_label_values(&[msg.msg_type().name()])
        .inc();
    Ok(msg)
}

// ---------------------------------------------------------------------------
// PeerChannel
// ---------------------------------------------------------------------------

/// One request/response exchange on an established connection.
///
/// The orchestrator talks to peers only through this seam, so tests can
/// drive it with a scripted in-process peer instead of a TCP session.
#[async_trait::async_trait]
pub trait PeerChannel: Send {
    async fn request(&mut self, msg: &Message) -> Result<Message, NetError>;
}

#[async_trait::async_trait]
impl PeerChannel for Session {
    async fn request(&mut self, msg: &Message) -> Result<Message, NetError> {
        Session::request(self, msg).await
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// An established client session to one peer.
pub struct Session {
    peer: NodeId,
    addr: SocketAddr,
    stream: TcpStream,
    state: SessionState,
    secure: Option<SecureChannel>,
    compress: bool,
    threshold: usize,
    timeout: Duration,
}

impl Session {
    /// Connect and run the handshake. On success the session is `Ready`.
    pub async fn connect(
        local_id: &NodeId,
        peer: NodeId,
        addr: SocketAddr,
        opts: &SessionOptions,
    ) -> Result<Self, NetError> {
        let stream = tokio::time::timeout(opts.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetError::Timeout)??;
        stream.set_nodelay(true)?;

        let ephemeral = opts.secure.then(EphemeralKeys::generate);

        let supported = if opts.compression {
            vec![COMPRESSION_BROTLI.to_string(), COMPRESSION_NONE.to_string()]
        } else {
            vec![COMPRESSION_NONE.to_string()]
        };
        let req = Message::HandshakeReq(HandshakeReq {
            node_id: local_id.as_str().to_string(),
            auth_token: opts.auth_token.clone(),
            supported_compression: supported,
            public_key: ephemeral.as_ref().map(|k| k.public_bytes().to_vec()),
        });

        let mut session = Self {
            peer,
            addr,
            stream,
            state: SessionState::Handshaking,
            secure: None,
            compress: false,
            threshold: opts.compression_threshold,
            timeout: opts.timeout,
        };

        // The handshake itself travels in plaintext, uncompressed.
        session.send_raw(&req).await?;
        let res = match session.recv_raw().await? {
            Message::HandshakeRes(res) => res,
            other => {
                return Err(NetError::Protocol(format!(
                    "expected handshake response, got {}",
                    other.msg_type().name()
                )));
            }
        };

        if !res.accepted {
            meshdb_metrics::metrics().handshake_failures.inc();
            return Err(NetError::Rejected(res.node_id));
        }

        session.secure = match (ephemeral, res.public_key) {
            (Some(keys), Some(peer_pub)) => Some(keys.agree(&peer_pub)?),
            (None, None) => None,
            (Some(_), None) => {
                return Err(NetError::Protocol(
                    "secure mode required but peer answered in plaintext".into(),
                ));
            }
            (None, Some(_)) => {
                return Err(NetError::Protocol(
                    "peer requires secure mode but this node is plaintext".into(),
                ));
            }
        };

        session.compress = res.selected_compression == COMPRESSION_BROTLI;
        session.state = SessionState::Ready;
        tracing::debug!(
            "session to {} at {} ready (compression: {}, secure: {})",
            session.peer,
            addr,
            res.selected_compression,
            session.secure.is_some()
        );
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer(&self) -> &NodeId {
        &self.peer
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// One request/response exchange. Any failure (including timeout)
    /// marks the session `Failed`; the caller discards it.
    pub async fn request(&mut self, msg: &Message) -> Result<Message, NetError> {
        if self.state != SessionState::Ready {
            return Err(NetError::Protocol(format!(
                "session to {} is {:?}, not Ready",
                self.peer, self.state
            )));
        }

        let _timer = meshdb_metrics::start_request_timer(msg.msg_type().name(), "outbound");
        let result = tokio::time::timeout(self.timeout, async {
            send_message(
                &mut self.stream,
                msg,
                self.secure.as_ref(),
                self.compress,
                self.threshold,
            )
            .await?;
            recv_message(&mut self.stream, self.secure.as_ref()).await
        })
        .await
        .unwrap_or(Err(NetError::Timeout));

        if result.is_err() {
            self.state = SessionState::Failed;
        }
        result
    }

    async fn send_raw(&mut self, msg: &Message) -> Result<(), NetError> {
        tokio::time::timeout(
            self.timeout,
            send_message(&mut self.stream, msg, None, false, usize::MAX),
        )
        .await
        .unwrap_or(Err(NetError::Timeout))
    }

    async fn recv_raw(&mut self) -> Result<Message, NetError> {
        tokio::time::timeout(self.timeout, recv_message(&mut self.stream, None))
            .await
            .unwrap_or(Err(NetError::Timeout))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("addr", &self.addr)
            .field("state", &self.state)
            .field("compress", &self.compress)
            .field("secure", &self.secure.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SessionPool
// ---------------------------------------------------------------------------

/// Pooled sessions keyed by peer. `take`/`put` give exclusive ownership
/// to one task at a time; failed sessions are simply never returned.
#[derive(Debug, Default)]
pub struct SessionPool {
    inner: Mutex<HashMap<NodeId, Session>>,
}

impl SessionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return the pooled session for `peer`, if any.
    pub async fn take(&self, peer: &NodeId) -> Option<Session> {
        self.inner.lock().await.remove(peer)
    }

    /// Return a session to the pool. Only `Ready` sessions are kept;
    /// anything else is dropped (closing the connection).
    pub async fn put(&self, session: Session) {
        if session.state() == SessionState::Ready {
            self.inner
                .lock()
                .await
                .insert(session.peer().clone(), session);
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Drop every pooled session (closes the connections).
    pub async fn clear(&self) {
        self.inner.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AckRes, ChangeSetRes, WireOplogEntry};
    use crate::secure::EphemeralKeys;

    fn big_change_set() -> Message {
        let entries = (0..100)
            .map(|i| WireOplogEntry {
                collection: "users".into(),
                key: format!("user-{}", i),
                operation: "Put".into(),
                json_data: format!(r#"{{"name":"user {}","bio":"{}"}}"#, i, "x".repeat(64)),
                hlc_wall: i,
                hlc_logic: 0,
                hlc_node: "node-a".into(),
            })
            .collect();
        Message::ChangeSetRes(ChangeSetRes { entries })
    }

    #[tokio::test]
    async fn test_send_recv_plaintext() {
        let (mut a, mut b) = tokio::io::duplex(1 << 20);
        let msg = Message::AckRes(AckRes { success: true });

        send_message(&mut a, &msg, None, false, 1024).await.unwrap();
        let got = recv_message(&mut b, None).await.unwrap();
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn test_send_recv_compressed_large_payload() {
        let (mut a, mut b) = tokio::io::duplex(1 << 20);
        let msg = big_change_set();

        send_message(&mut a, &msg, None, true, 1024).await.unwrap();
        let got = recv_message(&mut b, None).await.unwrap();
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn test_send_recv_secure() {
        let ka = EphemeralKeys::generate();
        let kb = EphemeralKeys::generate();
        let pa = ka.public_bytes().to_vec();
        let pb = kb.public_bytes().to_vec();
        let ca = ka.agree(&pb).unwrap();
        let cb = kb.agree(&pa).unwrap();

        let (mut a, mut b) = tokio::io::duplex(1 << 20);
        let msg = big_change_set();

        // Compression is applied to the inner payload before encryption.
        send_message(&mut a, &msg, Some(&ca), true, 1024)
            .await
            .unwrap();
        let got = recv_message(&mut b, Some(&cb)).await.unwrap();
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn test_plaintext_receiver_rejects_secure_envelope() {
        let ka = EphemeralKeys::generate();
        let kb = EphemeralKeys::generate();
        let pb = kb.public_bytes().to_vec();
        let ca = ka.agree(&pb).unwrap();

        let (mut a, mut b) = tokio::io::duplex(1 << 20);
        let msg = Message::AckRes(AckRes { success: true });
        send_message(&mut a, &msg, Some(&ca), false, 1024)
            .await
            .unwrap();

        let err = recv_message(&mut b, None).await.unwrap_err();
        assert!(matches!(err, NetError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_secure_receiver_rejects_plaintext() {
        let ka = EphemeralKeys::generate();
        let kb = EphemeralKeys::generate();
        let pa = ka.public_bytes().to_vec();
        let cb = kb.agree(&pa).unwrap();

        let (mut a, mut b) = tokio::io::duplex(1 << 20);
        let msg = Message::AckRes(AckRes { success: true });
        send_message(&mut a, &msg, None, false, 1024).await.unwrap();

        let err = recv_message(&mut b, Some(&cb)).await.unwrap_err();
        assert!(matches!(err, NetError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_pool_take_gives_exclusive_ownership() {
        let pool = SessionPool::new();
        assert!(pool.take(&NodeId::from("a")).await.is_none());
        assert!(pool.is_empty().await);
    }
}
