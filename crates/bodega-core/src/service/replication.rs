//! Log-shipping replication
//!
//! Each branch appends its own applied operations to an in-memory log,
//! broadcasts new entries eagerly and reconciles lazily: every sync interval
//! it asks each live peer for the entries it has not yet applied. Entries are
//! identified by `(origin, timestamp)` so application is idempotent; ties
//! between concurrent entries resolve by `(timestamp, origin)`.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, RwLock as StdRwLock},
    time::Duration,
};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};

use bodega_api::message::{
    Envelope, KEY_ENTRY, KEY_ENTRY_COUNT, KEY_FROM_TIMESTAMP, KEY_TIMESTAMP, MessageKind,
};
use bodega_api::sync::{LogEntry, LogOp};

use crate::clock::LamportClock;
use crate::service::transport::PeerTransport;

/// Replication configuration
#[derive(Clone, Debug)]
pub struct ReplicationConfig {
    /// Period of the catch-up sync task
    pub sync_interval: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(10),
        }
    }
}

/// Applies replicated entries from other branches
#[async_trait::async_trait]
pub trait LogApplier: Send + Sync {
    async fn apply(&self, entry: &LogEntry);
}

/// Broadcasts local log entries and answers catch-up requests
pub struct ReplicationEngine {
    node_id: String,
    clock: Arc<LamportClock>,
    transport: Arc<PeerTransport>,
    config: ReplicationConfig,
    log: StdRwLock<Vec<LogEntry>>,
    applied: Mutex<HashSet<(String, u64)>>,
    last_applied: Arc<DashMap<String, u64>>,
    applier: RwLock<Option<Arc<dyn LogApplier>>>,
    running: Arc<RwLock<bool>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ReplicationEngine {
    pub fn new(
        node_id: &str,
        clock: Arc<LamportClock>,
        transport: Arc<PeerTransport>,
        config: ReplicationConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            node_id: node_id.to_string(),
            clock,
            transport,
            config,
            log: StdRwLock::new(Vec::new()),
            applied: Mutex::new(HashSet::new()),
            last_applied: Arc::new(DashMap::new()),
            applier: RwLock::new(None),
            running: Arc::new(RwLock::new(false)),
            shutdown_tx,
        }
    }

    pub async fn set_applier(&self, applier: Arc<dyn LogApplier>) {
        let mut guard = self.applier.write().await;
        *guard = Some(applier);
    }

    /// Record a locally applied operation and broadcast it
    ///
    /// The caller applies the operation to the inventory first; the log
    /// replicates effects, not intents.
    pub fn log(&self, op: LogOp, resource_id: &str, payload: HashMap<String, Value>) -> LogEntry {
        let timestamp = self.clock.tick();
        let entry = LogEntry::new(&self.node_id, timestamp, op, resource_id, payload);

        self.log
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry.clone());
        self.applied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(entry.key());

        let mut envelope = Envelope::for_resource(
            MessageKind::LogEntry,
            &self.node_id,
            None,
            resource_id,
            timestamp,
        );
        envelope.put(KEY_ENTRY, serde_json::to_value(&entry).unwrap_or(Value::Null));
        let delivered = self.transport.broadcast(&envelope);
        debug!(
            node = %self.node_id,
            op = %op,
            resource = resource_id,
            ts = timestamp,
            delivered,
            "Logged operation"
        );

        entry
    }

    /// Start the periodic catch-up task
    pub async fn start(&self) {
        let mut running = self.running.write().await;
        if *running {
            return;
        }
        *running = true;
        drop(running);

        let node_id = self.node_id.clone();
        let clock = self.clock.clone();
        let transport = self.transport.clone();
        let last_applied = self.last_applied.clone();
        let interval = self.config.sync_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                for peer in transport.live_peers() {
                    let from_ts = last_applied.get(&peer).map(|e| *e.value()).unwrap_or(0);
                    let mut request =
                        Envelope::to(MessageKind::SyncRequest, &node_id, &peer, clock.tick());
                    request.put(KEY_FROM_TIMESTAMP, from_ts);
                    if let Err(e) = transport.send(&peer, request) {
                        debug!(node = %node_id, peer = %peer, "Sync request failed: {}", e);
                    }
                }
            }
            debug!(node = %node_id, "Replication sync task stopped");
        });

        info!(node = %self.node_id, "Replication engine started");
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        if !*running {
            return;
        }
        *running = false;

        let _ = self.shutdown_tx.send(true);
        info!(node = %self.node_id, "Replication engine stopped");
    }

    /// Route an inbound replication envelope
    ///
    /// The caller has already merged the envelope timestamp into the clock.
    pub async fn handle(&self, envelope: &Envelope) {
        match envelope.kind {
            MessageKind::LogEntry => self.handle_log_entry(envelope).await,
            MessageKind::SyncRequest => self.handle_sync_request(envelope),
            MessageKind::SyncResponse => {
                debug!(
                    node = %self.node_id,
                    peer = %envelope.sender_id,
                    entries = envelope.uint_value(KEY_ENTRY_COUNT).unwrap_or(0),
                    "Catch-up stream complete"
                );
            }
            MessageKind::LogAck => self.handle_log_ack(envelope),
            _ => {}
        }
    }

    async fn handle_log_entry(&self, envelope: &Envelope) {
        let Some(raw) = envelope.payload.get(KEY_ENTRY) else {
            warn!(node = %self.node_id, "LOG_ENTRY without entry payload, discarding");
            return;
        };
        let entry: LogEntry = match serde_json::from_value(raw.clone()) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(node = %self.node_id, "Malformed log entry, discarding: {}", e);
                return;
            }
        };

        if entry.origin == self.node_id {
            return;
        }

        let first_seen = self
            .applied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(entry.key());

        if first_seen {
            let applier = { self.applier.read().await.clone() };
            if let Some(applier) = applier {
                applier.apply(&entry).await;
            }
            debug!(node = %self.node_id, %entry, "Applied replicated entry");
        }

        self.raise_last_applied(&entry.origin, entry.timestamp);

        // Acknowledge even when already applied; acks are idempotent.
        let mut ack = Envelope::to(
            MessageKind::LogAck,
            &self.node_id,
            &envelope.sender_id,
            self.clock.tick(),
        );
        ack.put(KEY_TIMESTAMP, entry.timestamp);
        if let Err(e) = self.transport.send(&envelope.sender_id, ack) {
            debug!(node = %self.node_id, "Log ack failed: {}", e);
        }
    }

    fn handle_sync_request(&self, envelope: &Envelope) {
        let from_ts = envelope.uint_value(KEY_FROM_TIMESTAMP).unwrap_or(0);
        let requester = &envelope.sender_id;

        let entries: Vec<LogEntry> = {
            let log = self.log.read().unwrap_or_else(|e| e.into_inner());
            log.iter()
                .filter(|entry| entry.timestamp > from_ts)
                .cloned()
                .collect()
        };

        debug!(
            node = %self.node_id,
            peer = %requester,
            from_ts,
            count = entries.len(),
            "Answering sync request"
        );

        let count = entries.len();
        for entry in entries {
            let mut message = Envelope::for_resource(
                MessageKind::LogEntry,
                &self.node_id,
                Some(requester),
                &entry.resource_id,
                self.clock.tick(),
            );
            message.put(KEY_ENTRY, serde_json::to_value(&entry).unwrap_or(Value::Null));
            if self.transport.send(requester, message).is_err() {
                // The peer went away mid-stream; it will re-request later.
                return;
            }
        }

        let mut done = Envelope::to(
            MessageKind::SyncResponse,
            &self.node_id,
            requester,
            self.clock.tick(),
        );
        done.put(KEY_ENTRY_COUNT, count as u64);
        let _ = self.transport.send(requester, done);
    }

    fn handle_log_ack(&self, envelope: &Envelope) {
        let Some(timestamp) = envelope.uint_value(KEY_TIMESTAMP) else {
            return;
        };
        self.raise_last_applied(&envelope.sender_id, timestamp);
    }

    fn raise_last_applied(&self, peer: &str, timestamp: u64) {
        self.last_applied
            .entry(peer.to_string())
            .and_modify(|current| *current = (*current).max(timestamp))
            .or_insert(timestamp);
    }

    pub fn log_len(&self) -> usize {
        self.log.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Highest timestamp exchanged with each peer
    pub fn sync_status(&self) -> HashMap<String, u64> {
        self.last_applied
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }
}

impl std::fmt::Debug for ReplicationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationEngine")
            .field("node_id", &self.node_id)
            .field("log_len", &self.log_len())
            .finish()
    }
}

/// Last-known stock levels of peer branches, fed by replicated entries
///
/// Entries carrying an absolute `newQuantity` set the replica value; entries
/// carrying only a delta adjust it.
#[derive(Default)]
pub struct ReplicaTracker {
    replicas: DashMap<String, DashMap<String, i64>>,
}

impl ReplicaTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Last observed quantity of `product_id` at `origin`
    pub fn peer_quantity(&self, origin: &str, product_id: &str) -> Option<i64> {
        self.replicas
            .get(origin)
            .and_then(|products| products.get(product_id).map(|q| *q.value()))
    }

    /// Snapshot of one peer's replica
    pub fn peer_snapshot(&self, origin: &str) -> HashMap<String, i64> {
        self.replicas
            .get(origin)
            .map(|products| {
                products
                    .iter()
                    .map(|e| (e.key().clone(), *e.value()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl LogApplier for ReplicaTracker {
    async fn apply(&self, entry: &LogEntry) {
        let products = self
            .replicas
            .entry(entry.origin.clone())
            .or_default();

        if let Some(absolute) = entry.new_quantity() {
            products.insert(entry.resource_id.clone(), absolute as i64);
            return;
        }

        let delta = entry.quantity().unwrap_or(0) as i64;
        let signed = match entry.op {
            LogOp::AddStock | LogOp::TransferIn => delta,
            LogOp::ReduceStock | LogOp::TransferOut => -delta,
        };
        let mut quantity = products.entry(entry.resource_id.clone()).or_insert(0);
        *quantity = (*quantity + signed).max(0);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn entry(origin: &str, ts: u64, op: LogOp, payload: HashMap<String, Value>) -> LogEntry {
        LogEntry::new(origin, ts, op, "P001", payload)
    }

    #[tokio::test]
    async fn test_replica_tracker_applies_deltas() {
        let tracker = ReplicaTracker::new();

        let mut add = HashMap::new();
        add.insert("quantity".to_string(), json!(5));
        tracker
            .apply(&entry("branch-a", 7, LogOp::AddStock, add))
            .await;

        let mut reduce = HashMap::new();
        reduce.insert("quantity".to_string(), json!(2));
        tracker
            .apply(&entry("branch-a", 9, LogOp::ReduceStock, reduce))
            .await;

        assert_eq!(tracker.peer_quantity("branch-a", "P001"), Some(3));
        assert_eq!(tracker.peer_quantity("branch-b", "P001"), None);
    }

    #[tokio::test]
    async fn test_replica_tracker_prefers_absolute_quantity() {
        let tracker = ReplicaTracker::new();

        let mut payload = HashMap::new();
        payload.insert("quantity".to_string(), json!(4));
        payload.insert("newQuantity".to_string(), json!(16));
        tracker
            .apply(&entry("branch-a", 11, LogOp::TransferOut, payload))
            .await;

        assert_eq!(tracker.peer_quantity("branch-a", "P001"), Some(16));
    }

    #[tokio::test]
    async fn test_replica_tracker_never_goes_negative() {
        let tracker = ReplicaTracker::new();

        let mut reduce = HashMap::new();
        reduce.insert("quantity".to_string(), json!(10));
        tracker
            .apply(&entry("branch-a", 3, LogOp::ReduceStock, reduce))
            .await;

        assert_eq!(tracker.peer_quantity("branch-a", "P001"), Some(0));
    }
}
