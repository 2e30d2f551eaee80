//! Relay routing, loop suppression and send pacing

use crate::lobby::Role;
use crate::membership::ConnectionTable;
use crate::transport::{ConnId, Transport};
use log::{debug, warn};
use shared::{Message, PeerId};
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Per-broadcast delivery counts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub sent: usize,
    /// Recipients whose connection was no longer open
    pub skipped: usize,
    pub failed: Vec<PeerId>,
}

/// Forwards `message` according to the local role.
///
/// A host fans out to every guest except the connection the message arrived
/// on. A client only talks to its host, and never echoes what the host sent.
/// One failed recipient never stops the rest of the broadcast. Handshake
/// messages carry no origin and are never relayed.
pub fn route<T: Transport + ?Sized>(
    transport: &mut T,
    table: &ConnectionTable,
    role: Role,
    message: &Message,
    arrived_from: Option<ConnId>,
) -> RelayReport {
    let mut report = RelayReport::default();
    if !message.is_relayable() {
        debug!("Not relaying {}", message.kind());
        return report;
    }

    let targets: Vec<(&PeerId, ConnId)> = match role {
        Role::Host => table
            .iter()
            .filter(|(_, conn)| Some(*conn) != arrived_from)
            .collect(),
        Role::Client => table
            .iter()
            .take(1)
            .filter(|(_, conn)| Some(*conn) != arrived_from)
            .collect(),
        Role::Unelected => Vec::new(),
    };

    for (peer, conn) in targets {
        if !transport.is_open(conn) {
            report.skipped += 1;
            continue;
        }
        match transport.send(conn, message) {
            Ok(()) => report.sent += 1,
            Err(e) => {
                debug!("Failed to relay {} to {}: {}", message.kind(), peer, e);
                report.failed.push(peer.clone());
            }
        }
    }

    if !report.failed.is_empty() {
        warn!(
            "Relay of {} reached {} peer(s), {} failed",
            message.kind(),
            report.sent,
            report.failed.len()
        );
    }
    report
}

/// Bounded memory of recently seen chat entry ids
#[derive(Debug, Clone)]
pub struct RecentIds {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Remembers `id`; returns false if it was already known
    pub fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Lets at most one action through per interval
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn allow(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}
