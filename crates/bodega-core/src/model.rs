//! Core configuration model
//!
//! Wraps the layered `config::Config` supplied by the launcher with typed
//! getters for everything the branch node needs at boot.

use std::time::Duration;

use config::Config;

use bodega_api::model::{DEFAULT_PEER_PORT, GATEWAY_PORT_OFFSET};
use bodega_common::{BodegaError, Result, is_valid_id};

/// A configured remote peer: `id@host:port`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerAddr {
    pub id: String,
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    /// Parse `id@host:port`; `id@host` falls back to the default peer port
    pub fn parse(s: &str, default_port: u16) -> Option<PeerAddr> {
        let (id, addr) = s.trim().split_once('@')?;
        if !is_valid_id(id) {
            return None;
        }

        let (host, port) = match addr.split_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().ok()?),
            None => (addr, default_port),
        };
        if host.is_empty() {
            return None;
        }

        Some(PeerAddr {
            id: id.to_string(),
            host: host.to_string(),
            port,
        })
    }
}

/// Application configuration wrapper
#[derive(Clone, Debug)]
pub struct Configuration {
    pub config: Config,
}

impl Configuration {
    pub fn from_config(config: Config) -> Self {
        Self { config }
    }

    /// Unique, non-empty branch identifier; startup aborts without one
    pub fn branch_id(&self) -> Result<String> {
        let id = self
            .config
            .get_string("bodega.branch.id")
            .map_err(|e| BodegaError::Config(e.to_string()))?;
        if !is_valid_id(&id) {
            return Err(BodegaError::Config(format!(
                "invalid branch id '{}'",
                id
            )));
        }
        Ok(id)
    }

    pub fn peer_port(&self) -> u16 {
        self.config
            .get_int("bodega.peer.port")
            .map(|p| p as u16)
            .unwrap_or(DEFAULT_PEER_PORT)
    }

    /// Port reserved for the external client gateway
    pub fn gateway_port(&self) -> u16 {
        self.peer_port() + GATEWAY_PORT_OFFSET
    }

    /// Initial peer list, comma-separated `id@host:port` entries
    pub fn peer_list(&self) -> Vec<PeerAddr> {
        let Ok(list) = self.config.get_string("bodega.peer.list") else {
            return Vec::new();
        };
        list.split(',')
            .filter(|s| !s.trim().is_empty())
            .filter_map(|s| PeerAddr::parse(s, DEFAULT_PEER_PORT))
            .collect()
    }

    pub fn scan_interval(&self) -> Duration {
        self.duration_secs("bodega.scan.interval.secs", 30)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.duration_secs("bodega.heartbeat.interval.secs", 60)
    }

    pub fn sync_interval(&self) -> Duration {
        self.duration_secs("bodega.sync.interval.secs", 10)
    }

    pub fn mutex_timeout(&self) -> Duration {
        self.duration_secs("bodega.mutex.timeout.secs", 5)
    }

    pub fn reservation_ttl(&self) -> Duration {
        self.duration_secs("bodega.reservation.ttl.secs", 30)
    }

    fn duration_secs(&self, key: &str, default: u64) -> Duration {
        let secs = self
            .config
            .get_int(key)
            .ok()
            .and_then(|v| u64::try_from(v).ok())
            .unwrap_or(default);
        Duration::from_secs(secs)
    }
}
