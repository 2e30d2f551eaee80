//! Error types for the lobby core

use shared::TransportError;
use thiserror::Error;

/// Reasons a [`LobbyConfig`](crate::config::LobbyConfig) is refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("lobby size must be at least 2, got {0}")]
    LobbySizeTooSmall(usize),
    #[error("max_retries must be at least 1")]
    NoRetries,
    #[error("health interval must be non-zero")]
    ZeroHealthInterval,
    #[error("rendezvous identity {0:?} is not a valid identity")]
    InvalidRendezvous(String),
}

/// Outcome of a failed rendezvous claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ClaimError {
    /// Another process already owns the rendezvous identity
    #[error("rendezvous identity is owned by another process")]
    Contention,
    /// A claim is already pending or held by this registry
    #[error("a rendezvous claim is already pending or held")]
    Busy,
    #[error("transport failure while claiming: {0}")]
    Transport(TransportError),
}

impl From<TransportError> for ClaimError {
    fn from(error: TransportError) -> Self {
        if error.is_contention() {
            ClaimError::Contention
        } else {
            ClaimError::Transport(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_id_maps_to_contention() {
        assert_eq!(
            ClaimError::from(TransportError::UnavailableId),
            ClaimError::Contention
        );
        assert_eq!(
            ClaimError::from(TransportError::Network),
            ClaimError::Transport(TransportError::Network)
        );
    }

    #[test]
    fn test_config_error_messages() {
        assert_eq!(
            ConfigError::LobbySizeTooSmall(1).to_string(),
            "lobby size must be at least 2, got 1"
        );
        assert!(ConfigError::InvalidRendezvous("bad id".into())
            .to_string()
            .contains("bad id"));
    }
}
