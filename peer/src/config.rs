//! Tunables for lobby formation, retries and relay pacing

use crate::error::ConfigError;
use shared::{PeerId, DEFAULT_LOBBY_SIZE, RENDEZVOUS_ID};
use std::time::Duration;

/// Every knob the lobby core reads
///
/// Defaults reproduce the production pacing: a 3-player lobby, 2 s + 3 s per
/// attempt backoff on `lobby_full`, a 30 s cooldown after five attempts and a
/// 10 s supervisor tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LobbyConfig {
    /// Target membership including the host
    pub lobby_size: usize,
    /// Well-known identity whose owner is the host of the forming lobby
    pub rendezvous_id: PeerId,
    pub retry_base: Duration,
    pub retry_step: Duration,
    /// Upper bound for a single backoff delay
    pub retry_cap: Duration,
    pub max_retries: u32,
    /// Wait applied once the retries are exhausted
    pub cooldown: Duration,
    /// Pause between losing the claim and probing the rendezvous
    pub discovery_delay: Duration,
    /// Pause before re-electing after a discovery connection error
    pub error_retry_delay: Duration,
    /// Pause before re-electing after a reset or host loss
    pub rejoin_delay: Duration,
    /// How long a sealed host keeps the rendezvous before releasing it
    pub release_grace: Duration,
    pub health_interval: Duration,
    /// Minimum spacing between outgoing player state messages
    pub state_broadcast_interval: Duration,
    /// Number of chat ids remembered for loop suppression
    pub recent_id_capacity: usize,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            lobby_size: DEFAULT_LOBBY_SIZE,
            rendezvous_id: PeerId::from(RENDEZVOUS_ID),
            retry_base: Duration::from_secs(2),
            retry_step: Duration::from_secs(3),
            retry_cap: Duration::from_secs(14),
            max_retries: 5,
            cooldown: Duration::from_secs(30),
            discovery_delay: Duration::from_secs(1),
            error_retry_delay: Duration::from_secs(3),
            rejoin_delay: Duration::from_secs(1),
            release_grace: Duration::from_secs(5),
            health_interval: Duration::from_secs(10),
            state_broadcast_interval: Duration::from_millis(100),
            recent_id_capacity: 256,
        }
    }
}

impl LobbyConfig {
    pub fn with_lobby_size(mut self, lobby_size: usize) -> Self {
        self.lobby_size = lobby_size;
        self
    }

    pub fn with_rendezvous_id(mut self, rendezvous_id: impl Into<PeerId>) -> Self {
        self.rendezvous_id = rendezvous_id.into();
        self
    }

    /// Shrinks every delay to `unit` so in-process swarms settle quickly.
    ///
    /// The relative ordering of the delays is kept: the grace period stays the
    /// longest wait a sealed host makes and the cooldown stays the longest
    /// wait overall.
    pub fn with_time_unit(mut self, unit: Duration) -> Self {
        self.retry_base = unit * 2;
        self.retry_step = unit;
        self.retry_cap = unit * 6;
        self.cooldown = unit * 10;
        self.discovery_delay = unit;
        self.error_retry_delay = unit * 2;
        self.rejoin_delay = unit;
        self.release_grace = unit * 3;
        self.health_interval = unit * 5;
        self.state_broadcast_interval = unit;
        self
    }

    /// Checks the invariants the lobby core relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lobby_size < 2 {
            return Err(ConfigError::LobbySizeTooSmall(self.lobby_size));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::NoRetries);
        }
        if self.health_interval.is_zero() {
            return Err(ConfigError::ZeroHealthInterval);
        }
        if !self.rendezvous_id.is_valid() {
            return Err(ConfigError::InvalidRendezvous(
                self.rendezvous_id.as_str().to_string(),
            ));
        }
        Ok(())
    }
}
