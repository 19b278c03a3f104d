//! Bodega Core - distributed coordination for a branch node
//!
//! This crate provides:
//! - The Lamport logical clock
//! - The framed TCP peer transport
//! - Ricart-Agrawala distributed mutual exclusion
//! - Log-shipping replication
//! - The branch coordinator and node wiring

pub mod clock;
pub mod model;
pub mod service;

pub use clock::LamportClock;
pub use model::{Configuration, PeerAddr};
pub use service::coordinator::{BranchCoordinator, StockEvent};
pub use service::mutex::{AcquireOutcome, MutexEngine};
pub use service::node::BranchNode;
pub use service::replication::ReplicationEngine;
pub use service::transport::{EnvelopeSender, MessageHandler, PeerTransport};
