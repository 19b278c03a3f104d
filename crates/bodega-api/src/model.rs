//! Common API models and constants
//!
//! Peer descriptors shared between the transport, the coordinator and the
//! external gateway.

use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use bodega_common::now_millis;

// Port conventions of the wider deployment: the client gateway listens on
// peer_port + 100, the staff chat line on peer_port + 1000. Both services are
// external to this workspace; the constants document the contract.
pub const GATEWAY_PORT_OFFSET: u16 = 100;
pub const CHAT_PORT_OFFSET: u16 = 1000;

pub const DEFAULT_PEER_PORT: u16 = 7200;

/// Liveness state of a remote branch node
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerState {
    Starting,
    #[default]
    Up,
    Suspicious,
    Down,
}

impl PeerState {
    pub fn is_healthy(&self) -> bool {
        matches!(self, PeerState::Up)
    }
}

impl Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerState::Starting => write!(f, "STARTING"),
            PeerState::Up => write!(f, "UP"),
            PeerState::Suspicious => write!(f, "SUSPICIOUS"),
            PeerState::Down => write!(f, "DOWN"),
        }
    }
}

impl FromStr for PeerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STARTING" => Ok(PeerState::Starting),
            "UP" => Ok(PeerState::Up),
            "SUSPICIOUS" => Ok(PeerState::Suspicious),
            "DOWN" => Ok(PeerState::Down),
            _ => Err(format!("Invalid peer state: {}", s)),
        }
    }
}

/// A remote branch node as seen by the local one
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub state: PeerState,
    pub last_heartbeat_ms: i64,
}

impl Peer {
    pub fn new(id: &str, host: &str, port: u16) -> Self {
        Self {
            id: id.to_string(),
            host: host.to_string(),
            port,
            state: PeerState::Up,
            last_heartbeat_ms: now_millis(),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_healthy(&self) -> bool {
        self.state.is_healthy()
    }

    /// Record liveness evidence (heartbeat or any inbound traffic)
    pub fn touch(&mut self) {
        self.last_heartbeat_ms = now_millis();
        self.state = PeerState::Up;
    }
}
