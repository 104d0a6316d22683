//! meshdb-net: the peer-to-peer sync protocol.
//!
//! Length-prefixed typed frames over TCP, optional Brotli compression,
//! an optional AEAD-encrypted envelope, the passive sync server, and the
//! active anti-entropy orchestrator.

pub mod frame;
pub mod message;
pub mod orchestrator;
pub mod secure;
pub mod server;
pub mod session;

pub use orchestrator::{OrchestratorSettings, SyncOrchestrator};
pub use server::{ServerSettings, SyncServer};
pub use session::{PeerChannel, Session, SessionOptions, SessionPool, SessionState};

/// Errors produced by the sync layer.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("network I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request timed out")]
    Timeout,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("message codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("handshake rejected by {0}")]
    Rejected(String),

    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error("database error: {0}")]
    Db(String),
}

impl From<meshdb_engine::DbError> for NetError {
    fn from(e: meshdb_engine::DbError) -> Self {
        NetError::Db(e.to_string())
    }
}
