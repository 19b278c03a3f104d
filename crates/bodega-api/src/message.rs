//! Message envelope and kinds for the peer wire protocol
//!
//! Every unit of branch-to-branch traffic is one `Envelope`: a typed kind, the
//! logical sender/receiver, an optional resource, a Lamport timestamp and a
//! key-value payload. Handlers switch on `kind` and read the payload through
//! the typed accessors.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// Well-known payload keys
pub const KEY_QUANTITY: &str = "quantity";
pub const KEY_APPROVED: &str = "approved";
pub const KEY_ACCEPTED: &str = "accepted";
pub const KEY_REQUEST_TIMESTAMP: &str = "requestTimestamp";
pub const KEY_FROM_TIMESTAMP: &str = "fromTimestamp";
pub const KEY_TIMESTAMP: &str = "timestamp";
pub const KEY_ENTRY: &str = "entry";
pub const KEY_ENTRY_COUNT: &str = "entryCount";
pub const KEY_PEER_PORT: &str = "peerPort";
pub const KEY_WALL_CLOCK_MS: &str = "wallClockMs";
pub const KEY_NEW_QUANTITY: &str = "newQuantity";
pub const KEY_FROM_BRANCH: &str = "fromBranch";
pub const KEY_TO_BRANCH: &str = "toBranch";
pub const KEY_REASON: &str = "reason";

/// Message kinds used on the peer wire
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    // Peer lifecycle
    PeerHello,
    PeerGoodbye,
    BranchHeartbeat,

    // Stock transfer protocol
    StockTransferRequest,
    StockTransferResponse,
    StockTransferConfirm,

    // Distributed mutex (Ricart-Agrawala)
    MutexRequest,
    MutexReply,

    // Replication / log shipping
    SyncRequest,
    SyncResponse,
    LogEntry,
    LogAck,

    // System messages
    Error,
    Ack,
    Ping,
    Pong,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageKind::PeerHello => "PEER_HELLO",
            MessageKind::PeerGoodbye => "PEER_GOODBYE",
            MessageKind::BranchHeartbeat => "BRANCH_HEARTBEAT",
            MessageKind::StockTransferRequest => "STOCK_TRANSFER_REQUEST",
            MessageKind::StockTransferResponse => "STOCK_TRANSFER_RESPONSE",
            MessageKind::StockTransferConfirm => "STOCK_TRANSFER_CONFIRM",
            MessageKind::MutexRequest => "MUTEX_REQUEST",
            MessageKind::MutexReply => "MUTEX_REPLY",
            MessageKind::SyncRequest => "SYNC_REQUEST",
            MessageKind::SyncResponse => "SYNC_RESPONSE",
            MessageKind::LogEntry => "LOG_ENTRY",
            MessageKind::LogAck => "LOG_ACK",
            MessageKind::Error => "ERROR",
            MessageKind::Ack => "ACK",
            MessageKind::Ping => "PING",
            MessageKind::Pong => "PONG",
        };
        write!(f, "{}", name)
    }
}

/// Typed payload carrier exchanged between branch nodes
///
/// `timestamp` is a Lamport timestamp: senders stamp a fresh `tick()` on every
/// outgoing envelope, receivers run `update(timestamp)` before interpreting
/// the payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub kind: MessageKind,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    pub timestamp: u64,
    #[serde(default)]
    pub payload: HashMap<String, Value>,
}

impl Envelope {
    /// Create an envelope with no receiver (broadcast or not-yet-addressed)
    pub fn new(kind: MessageKind, sender_id: &str, timestamp: u64) -> Self {
        Self {
            kind,
            sender_id: sender_id.to_string(),
            receiver_id: None,
            resource_id: None,
            timestamp,
            payload: HashMap::new(),
        }
    }

    /// Create an envelope addressed to a specific peer
    pub fn to(kind: MessageKind, sender_id: &str, receiver_id: &str, timestamp: u64) -> Self {
        let mut envelope = Self::new(kind, sender_id, timestamp);
        envelope.receiver_id = Some(receiver_id.to_string());
        envelope
    }

    /// Create an envelope about a specific resource
    pub fn for_resource(
        kind: MessageKind,
        sender_id: &str,
        receiver_id: Option<&str>,
        resource_id: &str,
        timestamp: u64,
    ) -> Self {
        let mut envelope = Self::new(kind, sender_id, timestamp);
        envelope.receiver_id = receiver_id.map(|r| r.to_string());
        envelope.resource_id = Some(resource_id.to_string());
        envelope
    }

    /// Insert a payload value
    pub fn put(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    /// Read a payload value as i64
    pub fn int_value(&self, key: &str) -> Option<i64> {
        self.payload.get(key).and_then(Value::as_i64)
    }

    /// Read a payload value as u64
    pub fn uint_value(&self, key: &str) -> Option<u64> {
        self.payload.get(key).and_then(Value::as_u64)
    }

    /// Read a payload value as &str
    pub fn str_value(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Read a payload value as bool
    pub fn bool_value(&self, key: &str) -> Option<bool> {
        self.payload.get(key).and_then(Value::as_bool)
    }
}

impl std::fmt::Display for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Envelope{{kind={}, from={}, to={}, resource={}, ts={}}}",
            self.kind,
            self.sender_id,
            self.receiver_id.as_deref().unwrap_or("*"),
            self.resource_id.as_deref().unwrap_or("-"),
            self.timestamp
        )
    }
}
