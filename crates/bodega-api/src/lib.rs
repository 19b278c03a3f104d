//! Bodega API - shared wire model for branch-to-branch communication
//!
//! This crate defines:
//! - The message envelope and its kinds
//! - Peer descriptors and node states
//! - Replication log entries

pub mod message;
pub mod model;
pub mod sync;

pub use message::{Envelope, MessageKind};
pub use model::{Peer, PeerState};
pub use sync::{LogEntry, LogOp};
