//! Peer change event handling
//!
//! Event-driven notifications for peer lifecycle changes: joins, departures
//! and liveness transitions observed through heartbeats.

use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info};

use bodega_api::model::{Peer, PeerState};
use bodega_common::now_millis;

/// Type of peer change event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerChangeType {
    PeerJoin,
    PeerLeave,
    PeerStateChange,
}

impl std::fmt::Display for PeerChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerChangeType::PeerJoin => write!(f, "PEER_JOIN"),
            PeerChangeType::PeerLeave => write!(f, "PEER_LEAVE"),
            PeerChangeType::PeerStateChange => write!(f, "PEER_STATE_CHANGE"),
        }
    }
}

/// Peer change event
#[derive(Clone, Debug)]
pub struct PeerChangeEvent {
    pub change_type: PeerChangeType,
    pub peer: Peer,
    pub previous_state: Option<PeerState>,
    pub timestamp: i64,
}

impl PeerChangeEvent {
    pub fn peer_join(peer: Peer) -> Self {
        Self {
            change_type: PeerChangeType::PeerJoin,
            peer,
            previous_state: None,
            timestamp: now_millis(),
        }
    }

    pub fn peer_leave(peer: Peer) -> Self {
        Self {
            change_type: PeerChangeType::PeerLeave,
            peer,
            previous_state: None,
            timestamp: now_millis(),
        }
    }

    pub fn peer_state_change(peer: Peer, previous_state: PeerState) -> Self {
        Self {
            change_type: PeerChangeType::PeerStateChange,
            peer,
            previous_state: Some(previous_state),
            timestamp: now_millis(),
        }
    }
}

/// Trait for handling peer change events
#[async_trait::async_trait]
pub trait PeerChangeListener: Send + Sync {
    async fn on_peer_change(&self, event: &PeerChangeEvent);
}

/// Publishes peer change events to subscribers and listeners
pub struct PeerEventPublisher {
    broadcast_tx: broadcast::Sender<PeerChangeEvent>,
    listeners: Arc<RwLock<Vec<Arc<dyn PeerChangeListener>>>>,
}

impl PeerEventPublisher {
    pub fn new(queue_size: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(queue_size);
        Self {
            broadcast_tx,
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn register_listener(&self, listener: Arc<dyn PeerChangeListener>) {
        let mut listeners = self.listeners.write().await;
        listeners.push(listener);
        debug!("Registered peer change listener, total: {}", listeners.len());
    }

    pub async fn publish(&self, event: PeerChangeEvent) {
        info!(
            "Publishing peer change event: {} for {}",
            event.change_type, event.peer.id
        );

        let _ = self.broadcast_tx.send(event.clone());

        let listeners = self.listeners.read().await;
        for listener in listeners.iter() {
            listener.on_peer_change(&event).await;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerChangeEvent> {
        self.broadcast_tx.subscribe()
    }
}

/// A simple logging listener for debugging
pub struct LoggingPeerChangeListener;

#[async_trait::async_trait]
impl PeerChangeListener for LoggingPeerChangeListener {
    async fn on_peer_change(&self, event: &PeerChangeEvent) {
        match event.change_type {
            PeerChangeType::PeerJoin => {
                info!("[PeerEvent] Peer joined: {} ({})", event.peer.id, event.peer.state);
            }
            PeerChangeType::PeerLeave => {
                info!("[PeerEvent] Peer left: {}", event.peer.id);
            }
            PeerChangeType::PeerStateChange => {
                if let Some(previous) = &event.previous_state {
                    info!(
                        "[PeerEvent] Peer state changed: {} ({} -> {})",
                        event.peer.id, previous, event.peer.state
                    );
                }
            }
        }
    }
}
