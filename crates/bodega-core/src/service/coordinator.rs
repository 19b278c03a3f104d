//! Branch coordinator
//!
//! Owns the inventory on the peer-facing side and is the only component that
//! originates outbound peer traffic for the branch. Routes every inbound
//! envelope by kind, runs the periodic low-stock scan and heartbeat, and
//! drives the two-phase stock transfer protocol:
//!
//! ```text
//! requester                         supplier
//!   STOCK_TRANSFER_REQUEST  ----->  reserve under the product mutex
//!   STOCK_TRANSFER_RESPONSE <-----  approved / refused
//!   STOCK_TRANSFER_CONFIRM  ----->  finalize, or restore the reservation
//! ```
//!
//! A reservation whose confirm never arrives expires after a TTL and is swept
//! back into stock, so a lost response can no longer leak units.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock as StdRwLock},
    time::Duration,
};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{RwLock, broadcast, watch};
use tracing::{debug, info, warn};

use bodega_api::message::{
    Envelope, KEY_ACCEPTED, KEY_APPROVED, KEY_FROM_BRANCH, KEY_NEW_QUANTITY, KEY_PEER_PORT,
    KEY_QUANTITY, KEY_REASON, KEY_REQUEST_TIMESTAMP, KEY_TO_BRANCH, KEY_WALL_CLOCK_MS,
    MessageKind,
};
use bodega_api::model::{Peer, PeerState};
use bodega_api::sync::LogOp;
use bodega_common::{BodegaError, Result, now_millis};
use bodega_inventory::{InventoryStore, Product};

use crate::clock::LamportClock;
use crate::model::Configuration;
use crate::service::mutex::{AcquireOutcome, MutexEngine};
use crate::service::peer_event::{PeerChangeEvent, PeerEventPublisher};
use crate::service::replication::{ReplicaTracker, ReplicationEngine};
use crate::service::transport::{MessageHandler, PeerTransport};

/// Coordinator configuration
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Period of the low-stock scan
    pub scan_interval: Duration,
    /// Period of the heartbeat broadcast
    pub heartbeat_interval: Duration,
    /// Window granted to the distributed mutex during a reservation
    pub mutex_timeout: Duration,
    /// How long an unconfirmed reservation is held
    pub reservation_ttl: Duration,
    /// Period of the reservation and liveness sweep
    pub sweep_interval: Duration,
    /// Queue depth for peer and stock event channels
    pub event_queue_size: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(60),
            mutex_timeout: Duration::from_secs(5),
            reservation_ttl: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            event_queue_size: 1024,
        }
    }
}

impl CoordinatorConfig {
    pub fn from_configuration(configuration: &Configuration) -> Self {
        Self {
            scan_interval: configuration.scan_interval(),
            heartbeat_interval: configuration.heartbeat_interval(),
            mutex_timeout: configuration.mutex_timeout(),
            reservation_ttl: configuration.reservation_ttl(),
            ..Self::default()
        }
    }
}

/// Stock change notification pushed to the external gateway
#[derive(Clone, Debug)]
pub struct StockEvent {
    pub product_id: String,
    pub quantity: u32,
    pub source: String,
    pub timestamp: i64,
}

#[derive(Clone, Debug)]
struct PendingReplenishment {
    quantity: u32,
    requested_ts: u64,
    requested_at_ms: i64,
}

#[derive(Clone, Debug)]
struct Reservation {
    product_id: String,
    quantity: u32,
    requester: String,
    reserved_at_ms: i64,
}

fn reservation_key(requester: &str, product_id: &str, request_ts: u64) -> String {
    format!("{}:{}:{}", requester, product_id, request_ts)
}

/// Per-branch coordination hub
pub struct BranchCoordinator {
    branch_id: String,
    clock: Arc<LamportClock>,
    inventory: Arc<InventoryStore>,
    transport: Arc<PeerTransport>,
    mutex: Arc<MutexEngine>,
    replication: Arc<ReplicationEngine>,
    replica_view: Arc<ReplicaTracker>,
    known_peers: Arc<StdRwLock<HashSet<String>>>,
    peer_table: Arc<DashMap<String, Peer>>,
    peer_events: Arc<PeerEventPublisher>,
    stock_events: broadcast::Sender<StockEvent>,
    pending_requests: Arc<DashMap<String, PendingReplenishment>>,
    reservations: Arc<DashMap<String, Reservation>>,
    config: CoordinatorConfig,
    running: Arc<RwLock<bool>>,
    shutdown_tx: watch::Sender<bool>,
}

impl BranchCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        branch_id: &str,
        clock: Arc<LamportClock>,
        inventory: Arc<InventoryStore>,
        transport: Arc<PeerTransport>,
        mutex: Arc<MutexEngine>,
        replication: Arc<ReplicationEngine>,
        replica_view: Arc<ReplicaTracker>,
        known_peers: Arc<StdRwLock<HashSet<String>>>,
        config: CoordinatorConfig,
    ) -> Self {
        let (stock_events, _) = broadcast::channel(config.event_queue_size);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            branch_id: branch_id.to_string(),
            clock,
            inventory,
            transport,
            mutex,
            replication,
            replica_view,
            known_peers,
            peer_table: Arc::new(DashMap::new()),
            peer_events: Arc::new(PeerEventPublisher::new(config.event_queue_size)),
            stock_events,
            pending_requests: Arc::new(DashMap::new()),
            reservations: Arc::new(DashMap::new()),
            config,
            running: Arc::new(RwLock::new(false)),
            shutdown_tx,
        }
    }

    /// Start the periodic scan, heartbeat and sweep tasks
    pub async fn start(self: &Arc<Self>) {
        let mut running = self.running.write().await;
        if *running {
            return;
        }
        *running = true;
        drop(running);

        self.spawn_scan_task();
        self.spawn_heartbeat_task();
        self.spawn_sweep_task();

        info!(branch = %self.branch_id, "Branch coordinator started");
    }

    /// Stop periodic tasks and say goodbye to the cluster
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        if !*running {
            return;
        }
        *running = false;

        let goodbye = Envelope::new(MessageKind::PeerGoodbye, &self.branch_id, self.clock.tick());
        self.transport.broadcast(&goodbye);

        let _ = self.shutdown_tx.send(true);
        info!(branch = %self.branch_id, "Branch coordinator stopped");
    }

    // ------------------------------------------------------------------
    // Gateway-facing surface
    // ------------------------------------------------------------------

    pub fn query_stock(&self, product_id: &str) -> Option<Product> {
        self.inventory.get(product_id)
    }

    pub fn all_stock(&self) -> Vec<Product> {
        self.inventory.list()
    }

    /// Ask every known peer to ship `quantity` units of `product_id`
    ///
    /// Fire-and-forget: submission always succeeds, the transfer outcome
    /// arrives asynchronously as a stock event.
    pub fn request_replenishment(&self, product_id: &str, quantity: u32) {
        if quantity == 0 {
            return;
        }

        let peers: Vec<String> = {
            let known = self.known_peers.read().unwrap_or_else(|e| e.into_inner());
            known.iter().cloned().collect()
        };
        if peers.is_empty() {
            debug!(branch = %self.branch_id, product_id, "No peers available for replenishment");
            return;
        }

        let request_ts = self.clock.tick();
        self.pending_requests.insert(
            product_id.to_string(),
            PendingReplenishment {
                quantity,
                requested_ts: request_ts,
                requested_at_ms: now_millis(),
            },
        );

        for peer in &peers {
            let mut request = Envelope::for_resource(
                MessageKind::StockTransferRequest,
                &self.branch_id,
                Some(peer),
                product_id,
                request_ts,
            );
            request.put(KEY_QUANTITY, quantity);
            if let Err(e) = self.transport.send(peer, request) {
                debug!(branch = %self.branch_id, peer = %peer, "Replenishment request failed: {}", e);
            }
        }

        info!(
            branch = %self.branch_id,
            %product_id,
            quantity,
            peers = peers.len(),
            "Requested stock replenishment"
        );
    }

    /// Record a local sale and replicate its effect
    pub fn record_sale(&self, product_id: &str, quantity: u32) -> bool {
        if !self.inventory.reduce(product_id, quantity) {
            return false;
        }
        self.replicate(LogOp::ReduceStock, product_id, quantity, None);
        self.publish_stock_event(product_id);
        true
    }

    /// Record a local restock delivery and replicate its effect
    pub fn restock(&self, product_id: &str, quantity: u32) -> bool {
        if !self.inventory.add_stock(product_id, quantity) {
            return false;
        }
        self.replicate(LogOp::AddStock, product_id, quantity, None);
        self.publish_stock_event(product_id);
        true
    }

    /// Dial a peer and record it in the known-peer set
    pub async fn connect_peer(&self, peer_id: &str, host: &str, port: u16) -> Result<bool> {
        if peer_id == self.branch_id {
            return Err(BodegaError::IllegalArgument(
                "a branch cannot peer with itself".to_string(),
            ));
        }

        self.transport.connect(peer_id, host, port).await?;

        let is_new = {
            let mut known = self.known_peers.write().unwrap_or_else(|e| e.into_inner());
            known.insert(peer_id.to_string())
        };
        let peer = Peer::new(peer_id, host, port);
        self.peer_table.insert(peer_id.to_string(), peer.clone());
        if is_new {
            self.peer_events.publish(PeerChangeEvent::peer_join(peer)).await;
        }
        Ok(true)
    }

    pub fn known_peers(&self) -> Vec<String> {
        let known = self.known_peers.read().unwrap_or_else(|e| e.into_inner());
        known.iter().cloned().collect()
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.peer_table.iter().map(|e| e.value().clone()).collect()
    }

    pub fn subscribe_stock_events(&self) -> broadcast::Receiver<StockEvent> {
        self.stock_events.subscribe()
    }

    pub fn peer_events(&self) -> &Arc<PeerEventPublisher> {
        &self.peer_events
    }

    /// Last replicated quantity of a product at a peer branch
    pub fn peer_stock(&self, peer_id: &str, product_id: &str) -> Option<i64> {
        self.replica_view.peer_quantity(peer_id, product_id)
    }

    pub fn inventory(&self) -> &Arc<InventoryStore> {
        &self.inventory
    }

    pub fn branch_id(&self) -> &str {
        &self.branch_id
    }

    /// Reservations currently held for other branches
    pub fn open_reservations(&self) -> usize {
        self.reservations.len()
    }

    // ------------------------------------------------------------------
    // Inbound handlers
    // ------------------------------------------------------------------

    async fn handle_peer_hello(&self, envelope: &Envelope) {
        let peer_id = envelope.sender_id.clone();
        if peer_id == self.branch_id {
            return;
        }
        let port = envelope.uint_value(KEY_PEER_PORT).unwrap_or(0) as u16;

        let is_new = {
            let mut known = self.known_peers.write().unwrap_or_else(|e| e.into_inner());
            known.insert(peer_id.clone())
        };
        let peer = self
            .peer_table
            .entry(peer_id.clone())
            .or_insert_with(|| Peer::new(&peer_id, "", port))
            .clone();

        if is_new {
            info!(branch = %self.branch_id, peer = %peer_id, "New peer connected");
            self.peer_events.publish(PeerChangeEvent::peer_join(peer)).await;
        }

        let ack = Envelope::to(MessageKind::Ack, &self.branch_id, &peer_id, self.clock.tick());
        if let Err(e) = self.transport.send(&peer_id, ack) {
            debug!(branch = %self.branch_id, "Hello ack failed: {}", e);
        }
    }

    async fn handle_peer_goodbye(&self, envelope: &Envelope) {
        let peer_id = &envelope.sender_id;
        let was_known = {
            let mut known = self.known_peers.write().unwrap_or_else(|e| e.into_inner());
            known.remove(peer_id)
        };
        if let Some((_, peer)) = self.peer_table.remove(peer_id) {
            self.peer_events.publish(PeerChangeEvent::peer_leave(peer)).await;
        } else if was_known {
            self.peer_events
                .publish(PeerChangeEvent::peer_leave(Peer::new(peer_id, "", 0)))
                .await;
        }
        info!(branch = %self.branch_id, peer = %peer_id, "Peer left the cluster");
    }

    /// Liveness only: the known-peer set that feeds the mutex quorum is
    /// grown by hellos and explicit connects, never by heartbeats.
    async fn handle_heartbeat(&self, envelope: &Envelope) {
        let peer_id = envelope.sender_id.clone();
        let state_change = {
            let mut entry = self
                .peer_table
                .entry(peer_id.clone())
                .or_insert_with(|| Peer::new(&peer_id, "", 0));
            let previous = entry.state;
            entry.touch();
            (previous != PeerState::Up).then(|| {
                PeerChangeEvent::peer_state_change(entry.clone(), previous)
            })
        };

        if let Some(event) = state_change {
            self.peer_events.publish(event).await;
        }
        debug!(
            branch = %self.branch_id,
            peer = %peer_id,
            wall_clock = envelope.int_value(KEY_WALL_CLOCK_MS).unwrap_or(0),
            "Heartbeat"
        );
    }

    /// Reserve stock for a requesting branch under the product mutex
    ///
    /// Spawned off the link's read task: the reservation waits on mutex
    /// replies that arrive through the same transport.
    fn handle_transfer_request(&self, envelope: &Envelope) {
        let Some(product_id) = envelope.resource_id.clone() else {
            warn!(branch = %self.branch_id, "Transfer request without resource, discarding");
            self.reply_error(&envelope.sender_id, "transfer request names no resource");
            return;
        };
        let quantity = envelope.uint_value(KEY_QUANTITY).unwrap_or(0) as u32;
        if quantity == 0 {
            warn!(branch = %self.branch_id, %product_id, "Transfer request without quantity, discarding");
            self.reply_error(&envelope.sender_id, "transfer request names no quantity");
            return;
        }

        let requester = envelope.sender_id.clone();
        let request_ts = envelope.timestamp;

        let branch_id = self.branch_id.clone();
        let clock = self.clock.clone();
        let inventory = self.inventory.clone();
        let mutex = self.mutex.clone();
        let transport = self.transport.clone();
        let reservations = self.reservations.clone();
        let mutex_timeout = self.config.mutex_timeout;

        tokio::spawn(async move {
            let approved = match mutex.acquire(&product_id, mutex_timeout).await {
                AcquireOutcome::Granted => {
                    let ok = inventory.transfer_out(&product_id, quantity, &requester);
                    if ok {
                        reservations.insert(
                            reservation_key(&requester, &product_id, request_ts),
                            Reservation {
                                product_id: product_id.clone(),
                                quantity,
                                requester: requester.clone(),
                                reserved_at_ms: now_millis(),
                            },
                        );
                    }
                    mutex.release(&product_id);
                    ok
                }
                outcome => {
                    debug!(
                        branch = %branch_id,
                        %product_id,
                        ?outcome,
                        "Could not serialize reservation, refusing transfer"
                    );
                    false
                }
            };

            let mut response = Envelope::for_resource(
                MessageKind::StockTransferResponse,
                &branch_id,
                Some(&requester),
                &product_id,
                clock.tick(),
            );
            response.put(KEY_QUANTITY, quantity);
            response.put(KEY_APPROVED, approved);
            response.put(KEY_REQUEST_TIMESTAMP, request_ts);
            if let Err(e) = transport.send(&requester, response) {
                debug!(branch = %branch_id, "Transfer response failed: {}", e);
            }

            if approved {
                info!(
                    branch = %branch_id,
                    %product_id,
                    quantity,
                    requester = %requester,
                    "Reserved stock for transfer"
                );
            }
        });
    }

    fn handle_transfer_response(&self, envelope: &Envelope) {
        let Some(product_id) = envelope.resource_id.clone() else {
            return;
        };
        let quantity = envelope.uint_value(KEY_QUANTITY).unwrap_or(0) as u32;
        let approved = envelope.bool_value(KEY_APPROVED).unwrap_or(false);
        let request_ts = envelope.uint_value(KEY_REQUEST_TIMESTAMP).unwrap_or(0);
        let supplier = envelope.sender_id.clone();

        if !approved || quantity == 0 {
            debug!(
                branch = %self.branch_id,
                %product_id,
                supplier = %supplier,
                "Transfer refused"
            );
            return;
        }

        // The first approval for the round wins; surplus approvals and
        // approvals quoting a superseded round are declined so the supplier
        // can restore its reservation immediately. The round is identified
        // by the request timestamp, mirroring the reservation key on the
        // supplier side.
        let accepted = self
            .pending_requests
            .remove_if(&product_id, |_, pending| pending.requested_ts == request_ts)
            .is_some();

        let mut confirm = Envelope::for_resource(
            MessageKind::StockTransferConfirm,
            &self.branch_id,
            Some(&supplier),
            &product_id,
            self.clock.tick(),
        );
        confirm.put(KEY_QUANTITY, quantity);
        confirm.put(KEY_ACCEPTED, accepted);
        confirm.put(KEY_REQUEST_TIMESTAMP, request_ts);
        if let Err(e) = self.transport.send(&supplier, confirm) {
            // The supplier's reservation TTL is the safety net here.
            warn!(branch = %self.branch_id, "Transfer confirm failed: {}", e);
        }

        if accepted {
            self.inventory.receive(&product_id, quantity);
            self.replicate(LogOp::TransferIn, &product_id, quantity, Some((KEY_FROM_BRANCH, &supplier)));
            self.publish_stock_event(&product_id);
            info!(
                branch = %self.branch_id,
                %product_id,
                quantity,
                supplier = %supplier,
                "Received stock transfer"
            );
        }
    }

    fn handle_transfer_confirm(&self, envelope: &Envelope) {
        let Some(product_id) = envelope.resource_id.clone() else {
            return;
        };
        let accepted = envelope.bool_value(KEY_ACCEPTED).unwrap_or(false);
        let request_ts = envelope.uint_value(KEY_REQUEST_TIMESTAMP).unwrap_or(0);

        let key = reservation_key(&envelope.sender_id, &product_id, request_ts);
        let Some((_, reservation)) = self.reservations.remove(&key) else {
            debug!(
                branch = %self.branch_id,
                %product_id,
                "Confirm for unknown or expired reservation, ignoring"
            );
            return;
        };

        if accepted {
            self.replicate(
                LogOp::TransferOut,
                &product_id,
                reservation.quantity,
                Some((KEY_TO_BRANCH, &reservation.requester)),
            );
            self.publish_stock_event(&product_id);
            info!(
                branch = %self.branch_id,
                %product_id,
                quantity = reservation.quantity,
                requester = %reservation.requester,
                "Finalized stock transfer"
            );
        } else {
            self.inventory.add_stock(&product_id, reservation.quantity);
            debug!(
                branch = %self.branch_id,
                %product_id,
                quantity = reservation.quantity,
                "Transfer declined, reservation restored"
            );
        }
    }

    fn reply_error(&self, to: &str, reason: &str) {
        let mut error = Envelope::to(MessageKind::Error, &self.branch_id, to, self.clock.tick());
        error.put(KEY_REASON, reason);
        let _ = self.transport.send(to, error);
    }

    fn handle_ping(&self, envelope: &Envelope) {
        let pong = Envelope::to(
            MessageKind::Pong,
            &self.branch_id,
            &envelope.sender_id,
            self.clock.tick(),
        );
        if let Err(e) = self.transport.send(&envelope.sender_id, pong) {
            debug!(branch = %self.branch_id, "Pong failed: {}", e);
        }
    }

    // ------------------------------------------------------------------
    // Periodic tasks
    // ------------------------------------------------------------------

    fn spawn_scan_task(self: &Arc<Self>) {
        let coordinator = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(coordinator.config.scan_interval) => {}
                }

                for product in coordinator.inventory.low_stock() {
                    let needed = product.replenishment_needed();
                    if needed == 0 {
                        continue;
                    }
                    if coordinator.pending_requests.contains_key(&product.product_id) {
                        continue;
                    }
                    coordinator.request_replenishment(&product.product_id, needed);
                }
            }
        });
    }

    fn spawn_heartbeat_task(self: &Arc<Self>) {
        let coordinator = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(coordinator.config.heartbeat_interval) => {}
                }

                let mut heartbeat = Envelope::new(
                    MessageKind::BranchHeartbeat,
                    &coordinator.branch_id,
                    coordinator.clock.tick(),
                );
                heartbeat.put(KEY_WALL_CLOCK_MS, now_millis());
                coordinator.transport.broadcast(&heartbeat);
            }
        });
    }

    /// Expires unconfirmed reservations and stale replenishment requests,
    /// and downgrades peers that stopped heartbeating.
    fn spawn_sweep_task(self: &Arc<Self>) {
        let coordinator = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(coordinator.config.sweep_interval) => {}
                }

                let now = now_millis();

                let reservation_ttl_ms = coordinator.config.reservation_ttl.as_millis() as i64;
                let expired: Vec<(String, Reservation)> = coordinator
                    .reservations
                    .iter()
                    .filter(|e| now - e.value().reserved_at_ms > reservation_ttl_ms)
                    .map(|e| (e.key().clone(), e.value().clone()))
                    .collect();
                for (key, reservation) in expired {
                    if coordinator.reservations.remove(&key).is_some() {
                        coordinator
                            .inventory
                            .add_stock(&reservation.product_id, reservation.quantity);
                        warn!(
                            branch = %coordinator.branch_id,
                            product_id = %reservation.product_id,
                            quantity = reservation.quantity,
                            requester = %reservation.requester,
                            "Reservation expired unconfirmed, stock restored"
                        );
                    }
                }

                let pending_ttl_ms = 2 * coordinator.config.scan_interval.as_millis() as i64;
                let stale: Vec<String> = coordinator
                    .pending_requests
                    .iter()
                    .filter(|e| now - e.value().requested_at_ms > pending_ttl_ms)
                    .map(|e| e.key().clone())
                    .collect();
                for product_id in stale {
                    if let Some((_, pending)) = coordinator.pending_requests.remove(&product_id) {
                        debug!(
                            branch = %coordinator.branch_id,
                            %product_id,
                            quantity = pending.quantity,
                            requested_ts = pending.requested_ts,
                            "Replenishment request expired without approval"
                        );
                    }
                }

                coordinator.sweep_liveness(now).await;
            }
        });
    }

    async fn sweep_liveness(&self, now: i64) {
        let heartbeat_ms = self.config.heartbeat_interval.as_millis() as i64;
        let mut events = Vec::new();

        for mut entry in self.peer_table.iter_mut() {
            let elapsed = now - entry.last_heartbeat_ms;
            let next_state = if elapsed > heartbeat_ms * 3 {
                PeerState::Down
            } else if elapsed > heartbeat_ms * 2 {
                PeerState::Suspicious
            } else {
                continue;
            };

            if entry.state != next_state {
                let previous = entry.state;
                entry.state = next_state;
                events.push(PeerChangeEvent::peer_state_change(entry.clone(), previous));
            }
        }

        for event in events {
            self.peer_events.publish(event).await;
        }
    }

    // ------------------------------------------------------------------

    fn replicate(
        &self,
        op: LogOp,
        product_id: &str,
        quantity: u32,
        counterpart: Option<(&str, &str)>,
    ) {
        let mut payload: HashMap<String, Value> = HashMap::new();
        payload.insert(KEY_QUANTITY.to_string(), Value::from(quantity));
        if let Some(product) = self.inventory.get(product_id) {
            payload.insert(KEY_NEW_QUANTITY.to_string(), Value::from(product.quantity));
        }
        if let Some((key, branch)) = counterpart {
            payload.insert(key.to_string(), Value::from(branch));
        }
        self.replication.log(op, product_id, payload);
    }

    fn publish_stock_event(&self, product_id: &str) {
        let Some(product) = self.inventory.get(product_id) else {
            return;
        };
        let _ = self.stock_events.send(StockEvent {
            product_id: product_id.to_string(),
            quantity: product.quantity,
            source: self.branch_id.clone(),
            timestamp: now_millis(),
        });
    }
}

#[async_trait::async_trait]
impl MessageHandler for BranchCoordinator {
    async fn handle(&self, envelope: Envelope) {
        // The clock merges the sender's timestamp before any payload is
        // interpreted; skipping this breaks the ordering guarantees.
        self.clock.update(envelope.timestamp);
        debug!(branch = %self.branch_id, "{}", envelope);

        match envelope.kind {
            MessageKind::PeerHello => self.handle_peer_hello(&envelope).await,
            MessageKind::PeerGoodbye => self.handle_peer_goodbye(&envelope).await,
            MessageKind::BranchHeartbeat => self.handle_heartbeat(&envelope).await,
            MessageKind::StockTransferRequest => self.handle_transfer_request(&envelope),
            MessageKind::StockTransferResponse => self.handle_transfer_response(&envelope),
            MessageKind::StockTransferConfirm => self.handle_transfer_confirm(&envelope),
            MessageKind::MutexRequest | MessageKind::MutexReply => self.mutex.handle(&envelope),
            MessageKind::SyncRequest
            | MessageKind::SyncResponse
            | MessageKind::LogEntry
            | MessageKind::LogAck => self.replication.handle(&envelope).await,
            MessageKind::Ping => self.handle_ping(&envelope),
            MessageKind::Pong | MessageKind::Ack => {
                debug!(branch = %self.branch_id, peer = %envelope.sender_id, kind = %envelope.kind, "Ack")
            }
            MessageKind::Error => {
                warn!(
                    branch = %self.branch_id,
                    peer = %envelope.sender_id,
                    "Peer reported an error: {:?}",
                    envelope.payload
                )
            }
        }
    }
}

impl std::fmt::Debug for BranchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchCoordinator")
            .field("branch_id", &self.branch_id)
            .field("peers", &self.peer_table.len())
            .field("reservations", &self.reservations.len())
            .finish()
    }
}
