//! Replication log entries
//!
//! Each branch keeps an append-only log of the operations it has applied
//! locally. Entries are identified by `(origin, timestamp)`; applying the same
//! entry twice has no additional effect.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Operation recorded in the replication log
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogOp {
    AddStock,
    ReduceStock,
    TransferOut,
    TransferIn,
}

impl std::fmt::Display for LogOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogOp::AddStock => write!(f, "ADD_STOCK"),
            LogOp::ReduceStock => write!(f, "REDUCE_STOCK"),
            LogOp::TransferOut => write!(f, "TRANSFER_OUT"),
            LogOp::TransferIn => write!(f, "TRANSFER_IN"),
        }
    }
}

/// One record of a locally applied operation
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Node that applied the operation
    pub origin: String,
    /// Lamport timestamp allocated when the entry was created
    pub timestamp: u64,
    pub op: LogOp,
    pub resource_id: String,
    #[serde(default)]
    pub payload: HashMap<String, Value>,
}

impl LogEntry {
    pub fn new(
        origin: &str,
        timestamp: u64,
        op: LogOp,
        resource_id: &str,
        payload: HashMap<String, Value>,
    ) -> Self {
        Self {
            origin: origin.to_string(),
            timestamp,
            op,
            resource_id: resource_id.to_string(),
            payload,
        }
    }

    /// Identity used for idempotent application
    pub fn key(&self) -> (String, u64) {
        (self.origin.clone(), self.timestamp)
    }

    pub fn quantity(&self) -> Option<u64> {
        self.payload.get("quantity").and_then(Value::as_u64)
    }

    pub fn new_quantity(&self) -> Option<u64> {
        self.payload.get("newQuantity").and_then(Value::as_u64)
    }
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "LogEntry{{origin={}, ts={}, op={}, resource={}}}",
            self.origin, self.timestamp, self.op, self.resource_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_log_entry_roundtrip() {
        let mut payload = HashMap::new();
        payload.insert("quantity".to_string(), json!(5));
        payload.insert("newQuantity".to_string(), json!(15));

        let entry = LogEntry::new("branch-1", 7, LogOp::AddStock, "P001", payload);
        let bytes = serde_json::to_vec(&entry).unwrap();
        let decoded: LogEntry = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(decoded.origin, "branch-1");
        assert_eq!(decoded.timestamp, 7);
        assert_eq!(decoded.op, LogOp::AddStock);
        assert_eq!(decoded.resource_id, "P001");
        assert_eq!(decoded.quantity(), Some(5));
        assert_eq!(decoded.new_quantity(), Some(15));
    }

    #[test]
    fn test_log_entry_key() {
        let a = LogEntry::new("branch-1", 7, LogOp::ReduceStock, "P001", HashMap::new());
        let b = LogEntry::new("branch-1", 7, LogOp::ReduceStock, "P001", HashMap::new());
        assert_eq!(a.key(), b.key());

        let c = LogEntry::new("branch-2", 7, LogOp::ReduceStock, "P001", HashMap::new());
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn test_log_op_wire_names() {
        let json = serde_json::to_string(&LogOp::TransferOut).unwrap();
        assert_eq!(json, "\"TRANSFER_OUT\"");
    }
}
