//! Error types for Bodega
//!
//! Recoverable failures surface as `BodegaError` values; nothing in the
//! cluster core panics on bad input or a lost peer.

use std::time::Duration;

/// Application-specific error types
#[derive(thiserror::Error, Debug)]
pub enum BodegaError {
    #[error("caused: {0}")]
    IllegalArgument(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("peer '{0}' is not reachable")]
    PeerUnavailable(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("node is shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, BodegaError>;

impl BodegaError {
    /// Whether the failure is transient and the operation may be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BodegaError::Network(_) | BodegaError::PeerUnavailable(_) | BodegaError::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BodegaError::IllegalArgument("empty product id".to_string());
        assert_eq!(format!("{}", err), "caused: empty product id");

        let err = BodegaError::PeerUnavailable("branch-2".to_string());
        assert_eq!(format!("{}", err), "peer 'branch-2' is not reachable");

        let err = BodegaError::Network("connection reset".to_string());
        assert_eq!(format!("{}", err), "network error: connection reset");
    }

    #[test]
    fn test_transient_classification() {
        assert!(BodegaError::PeerUnavailable("b".into()).is_transient());
        assert!(BodegaError::Timeout(Duration::from_secs(5)).is_transient());
        assert!(!BodegaError::IllegalArgument("x".into()).is_transient());
        assert!(!BodegaError::ShuttingDown.is_transient());
    }
}
