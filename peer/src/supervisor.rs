//! Retry backoff and periodic health assessment

use crate::config::LobbyConfig;
use std::time::Duration;

/// Delays applied after a `lobby_full` rejection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub step: Duration,
    pub cap: Duration,
    pub max_retries: u32,
    pub cooldown: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &LobbyConfig) -> Self {
        Self {
            base: config.retry_base,
            step: config.retry_step,
            cap: config.retry_cap,
            max_retries: config.max_retries,
            cooldown: config.cooldown,
        }
    }

    /// Delay for the `attempt`-th consecutive rejection
    pub fn delay_for(&self, attempt: u32) -> Duration {
        (self.base + self.step * attempt).min(self.cap)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Retry { attempt: u32, delay: Duration },
    /// Retries exhausted; the counter has been reset
    Cooldown { delay: Duration },
}

impl Backoff {
    pub fn delay(&self) -> Duration {
        match self {
            Backoff::Retry { delay, .. } | Backoff::Cooldown { delay } => *delay,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryState {
    retry_count: u32,
}

impl RetryState {
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn escalate(&mut self, policy: &RetryPolicy) -> Backoff {
        self.retry_count += 1;
        if self.retry_count < policy.max_retries {
            Backoff::Retry {
                attempt: self.retry_count,
                delay: policy.delay_for(self.retry_count),
            }
        } else {
            self.retry_count = 0;
            Backoff::Cooldown {
                delay: policy.cooldown,
            }
        }
    }

    pub fn reset(&mut self) {
        self.retry_count = 0;
    }
}

/// Liveness as seen by the supervisor tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// Own identity not registered yet
    Offline,
    /// Not in a lobby and nothing in flight
    Idle,
    /// Claim pending, discovery or backoff running, or a reset under way
    InFlight,
    Host { open: usize, total: usize },
    Client { host_open: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    /// Leave things alone until the current step resolves
    Wait,
    /// Lost the host; tear down and start over
    Rejoin,
    /// Start a fresh election
    Elect,
}

/// Owns the retry counter and turns health readings into verdicts
#[derive(Debug, Clone)]
pub struct Supervisor {
    policy: RetryPolicy,
    retry: RetryState,
}

impl Supervisor {
    pub fn new(config: &LobbyConfig) -> Self {
        Self {
            policy: RetryPolicy::from_config(config),
            retry: RetryState::default(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn retry_count(&self) -> u32 {
        self.retry.retry_count()
    }

    pub fn on_lobby_full(&mut self) -> Backoff {
        self.retry.escalate(&self.policy)
    }

    /// Called after a successful election or pairing
    pub fn on_settled(&mut self) {
        self.retry.reset();
    }

    /// A host is always left alone, even with dead guests: membership
    /// cleanup runs off connection events, not off the tick.
    pub fn assess(&self, health: Health) -> Verdict {
        match health {
            Health::Offline | Health::InFlight => Verdict::Wait,
            Health::Idle => Verdict::Elect,
            Health::Host { .. } => Verdict::Healthy,
            Health::Client { host_open: true } => Verdict::Healthy,
            Health::Client { host_open: false } => Verdict::Rejoin,
        }
    }
}
