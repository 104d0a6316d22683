//! Typed wire messages and their binary codec.
//!
//! Payloads are bincode-encoded records; the frame layer (`frame.rs`)
//! carries them with a one-byte type tag drawn from [`MessageType`].

use crate::NetError;
use meshdb_common::{HlcTimestamp, NodeId};
use meshdb_storage::record::{Operation, OplogEntry};
use serde::{Deserialize, Serialize};

/// The closed set of frame type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    HandshakeReq = 1,
    HandshakeRes = 2,
    GetClockReq = 3,
    ClockRes = 4,
    PullChangesReq = 5,
    ChangeSetRes = 6,
    PushChangesReq = 7,
    AckRes = 8,
    SecureEnv = 9,
}

impl MessageType {
    pub fn from_u8(raw: u8) -> Result<Self, NetError> {
        Ok(match raw {
            1 => Self::HandshakeReq,
            2 => Self::HandshakeRes,
            3 => Self::GetClockReq,
            4 => Self::ClockRes,
            5 => Self::PullChangesReq,
            6 => Self::ChangeSetRes,
            7 => Self::PushChangesReq,
            8 => Self::AckRes,
            9 => Self::SecureEnv,
            other => return Err(NetError::Protocol(format!("unknown message type {}", other))),
        })
    }

    /// Label for logs and metrics.
    pub fn name(self) -> &'static str {
        match self {
            Self::HandshakeReq => "handshake_req",
            Self::HandshakeRes => "handshake_res",
            Self::GetClockReq => "get_clock",
            Self::ClockRes => "clock_res",
            Self::PullChangesReq => "pull_changes",
            Self::ChangeSetRes => "change_set",
            Self::PushChangesReq => "push_changes",
            Self::AckRes => "ack",
            Self::SecureEnv => "secure_env",
        }
    }
}

// ---------------------------------------------------------------------------
// Record types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandshakeReq {
    pub node_id: String,
    pub auth_token: String,
    pub supported_compression: Vec<String>,
    /// P-256 ephemeral public key (SEC1), present iff the initiator runs
    /// in secure mode. Secure and plaintext clusters do not mix.
    pub public_key: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandshakeRes {
    pub node_id: String,
    pub accepted: bool,
    pub selected_compression: String,
    /// Responder's P-256 ephemeral public key in secure mode.
    pub public_key: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClockRes {
    pub hlc_wall: i64,
    pub hlc_logic: i32,
    pub hlc_node: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PullChangesReq {
    pub since_wall: i64,
    pub since_logic: i32,
    pub since_node: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeSetRes {
    pub entries: Vec<WireOplogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushChangesReq {
    pub entries: Vec<WireOplogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AckRes {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecureEnv {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub auth_tag: Vec<u8>,
}

/// Wire form of an oplog entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireOplogEntry {
    pub collection: String,
    pub key: String,
    /// "Put" or "Delete".
    pub operation: String,
    /// JSON body; empty string for deletes.
    pub json_data: String,
    pub hlc_wall: i64,
    pub hlc_logic: i32,
    pub hlc_node: String,
}

impl From<&OplogEntry> for WireOplogEntry {
    fn from(entry: &OplogEntry) -> Self {
        Self {
            collection: entry.collection.clone(),
            key: entry.key.clone(),
            operation: match entry.op {
                Operation::Put => "Put".to_string(),
                Operation::Delete => "Delete".to_string(),
            },
            json_data: entry.body.clone().unwrap_or_default(),
            hlc_wall: entry.timestamp.wall,
            hlc_logic: entry.timestamp.logical,
            hlc_node: entry.timestamp.node.as_str().to_string(),
        }
    }
}

impl WireOplogEntry {
    pub fn into_entry(self) -> Result<OplogEntry, NetError> {
        let op = match self.operation.as_str() {
            "Put" => Operation::Put,
            "Delete" => Operation::Delete,
            other => {
                return Err(NetError::Protocol(format!("unknown operation {:?}", other)));
            }
        };
        Ok(OplogEntry {
            collection: self.collection,
            key: self.key,
            body: match op {
                Operation::Put => Some(self.json_data),
                Operation::Delete => None,
            },
            op,
            timestamp: HlcTimestamp::new(self.hlc_wall, self.hlc_logic, NodeId::from(self.hlc_node)),
        })
    }
}

/// Helpers shared by the clock/pull message shapes.
pub fn timestamp_to_parts(ts: &HlcTimestamp) -> (i64, i32, String) {
    (ts.wall, ts.logical, ts.node.as_str().to_string())
}

pub fn timestamp_from_parts(wall: i64, logical: i32, node: String) -> HlcTimestamp {
    HlcTimestamp::new(wall, logical, NodeId::from(node))
}

// ---------------------------------------------------------------------------
// Message envelope
// ---------------------------------------------------------------------------

/// One logical wire message: type tag plus record.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    HandshakeReq(HandshakeReq),
    HandshakeRes(HandshakeRes),
    GetClockReq,
    ClockRes(ClockRes),
    PullChangesReq(PullChangesReq),
    ChangeSetRes(ChangeSetRes),
    PushChangesReq(PushChangesReq),
    AckRes(AckRes),
    SecureEnv(SecureEnv),
}

impl Message {
    pub fn msg_type(&self) -> MessageType {
        match self {
            Self::HandshakeReq(_) => MessageType::HandshakeReq,
            Self::HandshakeRes(_) => MessageType::HandshakeRes,
            Self::GetClockReq => MessageType::GetClockReq,
            Self::ClockRes(_) => MessageType::ClockRes,
            Self::PullChangesReq(_) => MessageType::PullChangesReq,
            Self::ChangeSetRes(_) => MessageType::ChangeSetRes,
            Self::PushChangesReq(_) => MessageType::PushChangesReq,
            Self::AckRes(_) => MessageType::AckRes,
            Self::SecureEnv(_) => MessageType::SecureEnv,
        }
    }

    /// Encode the record (without the frame header).
    pub fn encode_payload(&self) -> Result<Vec<u8>, NetError> {
        let bytes = match self {
            Self::HandshakeReq(m) => bincode::serialize(m)?,
            Self::HandshakeRes(m) => bincode::serialize(m)?,
            Self::GetClockReq => Vec::new(),
            Self::ClockRes(m) => bincode::serialize(m)?,
            Self::PullChangesReq(m) => bincode::serialize(m)?,
            Self::ChangeSetRes(m) => bincode::serialize(m)?,
            Self::PushChangesReq(m) => bincode::serialize(m)?,
            Self::AckRes(m) => bincode::serialize(m)?,
            Self::SecureEnv(m) => bincode::serialize(m)?,
        };
        Ok(bytes)
    }

    /// Decode a record from its type tag and payload bytes.
    pub fn decode(msg_type: MessageType, payload: &[u8]) -> Result<Self, NetError> {
        Ok(match msg_type {
            MessageType::HandshakeReq => Self::HandshakeReq(bincode::deserialize(payload)?),
            MessageType::HandshakeRes => Self::HandshakeRes(bincode::deserialize(payload)?),
            MessageType::GetClockReq => Self::GetClockReq,
            MessageType::ClockRes => Self::ClockRes(bincode::deserialize(payload)?),
            MessageType::PullChangesReq => Self::PullChangesReq(bincode::deserialize(payload)?),
            MessageType::ChangeSetRes => Self::ChangeSetRes(bincode::deserialize(payload)?),
            MessageType::PushChangesReq => Self::PushChangesReq(bincode::deserialize(payload)?),
            MessageType::AckRes => Self::AckRes(bincode::deserialize(payload)?),
            MessageType::SecureEnv => Self::SecureEnv(bincode::deserialize(payload)?),
        })
    }
}
