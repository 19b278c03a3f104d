//! Branch node wiring
//!
//! Builds and owns every subsystem of one branch: clock, inventory, transport,
//! mutex engine, replication engine and coordinator. Start order is transport
//! first; shutdown runs coordinator, replication, mutex, transport, so
//! in-flight work drains before the sockets close.

use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::{Arc, RwLock as StdRwLock},
};

use tracing::{info, warn};

use bodega_common::Result;
use bodega_inventory::InventoryStore;

use crate::clock::LamportClock;
use crate::model::{Configuration, PeerAddr};
use crate::service::coordinator::{BranchCoordinator, CoordinatorConfig};
use crate::service::mutex::MutexEngine;
use crate::service::peer_event::LoggingPeerChangeListener;
use crate::service::replication::{ReplicaTracker, ReplicationConfig, ReplicationEngine};
use crate::service::transport::{PeerTransport, TransportConfig};

/// One branch process: a peer identity, an inventory and the coordination
/// services around it
pub struct BranchNode {
    branch_id: String,
    peer_port: u16,
    initial_peers: Vec<PeerAddr>,
    clock: Arc<LamportClock>,
    inventory: Arc<InventoryStore>,
    transport: Arc<PeerTransport>,
    mutex: Arc<MutexEngine>,
    replication: Arc<ReplicationEngine>,
    replica_view: Arc<ReplicaTracker>,
    coordinator: Arc<BranchCoordinator>,
}

impl BranchNode {
    pub fn new(configuration: &Configuration) -> Result<Self> {
        let branch_id = configuration.branch_id()?;
        let peer_port = configuration.peer_port();
        let initial_peers = configuration.peer_list();

        let clock = Arc::new(LamportClock::new());
        let inventory = Arc::new(InventoryStore::new(&branch_id));
        let transport = Arc::new(PeerTransport::new(
            &branch_id,
            clock.clone(),
            TransportConfig::default(),
        ));

        let known_peers = Arc::new(StdRwLock::new(HashSet::new()));
        let mutex = Arc::new(MutexEngine::new(
            &branch_id,
            clock.clone(),
            known_peers.clone(),
            transport.clone(),
        ));

        let replication = Arc::new(ReplicationEngine::new(
            &branch_id,
            clock.clone(),
            transport.clone(),
            ReplicationConfig {
                sync_interval: configuration.sync_interval(),
            },
        ));

        let replica_view = ReplicaTracker::new();
        let coordinator = Arc::new(BranchCoordinator::new(
            &branch_id,
            clock.clone(),
            inventory.clone(),
            transport.clone(),
            mutex.clone(),
            replication.clone(),
            replica_view.clone(),
            known_peers,
            CoordinatorConfig::from_configuration(configuration),
        ));

        Ok(Self {
            branch_id,
            peer_port,
            initial_peers,
            clock,
            inventory,
            transport,
            mutex,
            replication,
            replica_view,
            coordinator,
        })
    }

    /// Bind the peer endpoint, start every service and dial configured peers
    pub async fn start(&self) -> Result<SocketAddr> {
        self.transport.set_handler(self.coordinator.clone()).await;
        // The tracker is shared between the replication engine (writer) and
        // the coordinator (reader).
        self.replication.set_applier(self.replica_view.clone()).await;
        self.coordinator
            .peer_events()
            .register_listener(Arc::new(LoggingPeerChangeListener))
            .await;

        let addr = self.transport.start(self.peer_port).await?;
        self.replication.start().await;
        self.coordinator.start().await;

        for peer in &self.initial_peers {
            if peer.id == self.branch_id {
                continue;
            }
            if let Err(e) = self
                .coordinator
                .connect_peer(&peer.id, &peer.host, peer.port)
                .await
            {
                warn!(
                    branch = %self.branch_id,
                    peer = %peer.id,
                    "Could not reach configured peer at startup: {}",
                    e
                );
            }
        }

        info!(branch = %self.branch_id, %addr, "Branch node started");
        Ok(addr)
    }

    /// Shut down in dependency order: coordinator, replication, mutex,
    /// transport
    pub async fn stop(&self) {
        self.coordinator.stop().await;
        self.replication.stop().await;
        self.mutex.shutdown();
        self.transport.stop().await;
        info!(branch = %self.branch_id, "Branch node stopped");
    }

    pub fn branch_id(&self) -> &str {
        &self.branch_id
    }

    pub fn clock(&self) -> &Arc<LamportClock> {
        &self.clock
    }

    pub fn inventory(&self) -> &Arc<InventoryStore> {
        &self.inventory
    }

    pub fn coordinator(&self) -> &Arc<BranchCoordinator> {
        &self.coordinator
    }

    pub fn mutex(&self) -> &Arc<MutexEngine> {
        &self.mutex
    }

    pub fn replication(&self) -> &Arc<ReplicationEngine> {
        &self.replication
    }

    pub fn transport(&self) -> &Arc<PeerTransport> {
        &self.transport
    }
}

impl std::fmt::Debug for BranchNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchNode")
            .field("branch_id", &self.branch_id)
            .field("peer_port", &self.peer_port)
            .finish()
    }
}
