//! Session, identity and channel bookkeeping for the rendezvous broker
//!
//! This module holds all broker state:
//! - Sessions (one per TCP connection) and the broker's capacity limit
//! - Identity ownership, with at most one owning session per identity
//! - Channels linking a dialing session to the session owning the target
//!
//! The registry is plain data; the network layer turns its return values
//! into packets.

use log::{debug, info};
use shared::{ChannelId, Packet, PeerId, TransportError};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

pub type SessionId = u32;

/// A connected peer process
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub addr: SocketAddr,
    /// Identities registered by this session, in registration order
    pub identities: Vec<PeerId>,
    pub connected_at: Instant,
}

impl Session {
    pub fn new(id: SessionId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            identities: Vec::new(),
            connected_at: Instant::now(),
        }
    }
}

/// A relayed point-to-point link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: ChannelId,
    pub dialer: SessionId,
    /// Identity the dialer speaks as
    pub from: PeerId,
    pub listener: SessionId,
    /// Identity the dialer reached
    pub to: PeerId,
}

impl Channel {
    /// The session at the other end from `session`
    pub fn other_end(&self, session: SessionId) -> Option<SessionId> {
        if session == self.dialer {
            Some(self.listener)
        } else if session == self.listener {
            Some(self.dialer)
        } else {
            None
        }
    }

    fn involves(&self, session: SessionId, identity: &PeerId) -> bool {
        (self.dialer == session && self.from == *identity)
            || (self.listener == session && self.to == *identity)
    }
}

/// A packet the network layer must send to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub session: SessionId,
    pub packet: Packet,
}

pub struct Registry {
    sessions: HashMap<SessionId, Session>,
    owners: HashMap<PeerId, SessionId>,
    channels: HashMap<ChannelId, Channel>,
    next_session_id: SessionId,
    next_channel_id: ChannelId,
    max_sessions: usize,
}

impl Registry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            owners: HashMap::new(),
            channels: HashMap::new(),
            next_session_id: 1,
            next_channel_id: 1,
            max_sessions,
        }
    }

    /// Returns None when the broker is at capacity
    pub fn add_session(&mut self, addr: SocketAddr) -> Option<SessionId> {
        if self.sessions.len() >= self.max_sessions {
            return None;
        }

        let id = self.next_session_id;
        self.next_session_id += 1;
        info!("Session {} opened from {}", id, addr);
        self.sessions.insert(id, Session::new(id, addr));
        Some(id)
    }

    /// Drops a session with every identity and channel it held
    pub fn remove_session(&mut self, session: SessionId) -> Vec<Delivery> {
        let Some(removed) = self.sessions.remove(&session) else {
            return Vec::new();
        };
        for identity in &removed.identities {
            self.owners.remove(identity);
        }

        let doomed: Vec<ChannelId> = self
            .channels
            .values()
            .filter(|c| c.dialer == session || c.listener == session)
            .map(|c| c.id)
            .collect();
        let deliveries = self.close_channels(&doomed, Some(session));

        info!(
            "Session {} closed after {:?}, released {} identities",
            session,
            removed.connected_at.elapsed(),
            removed.identities.len()
        );
        deliveries
    }

    pub fn register(&mut self, session: SessionId, identity: PeerId) -> Result<(), TransportError> {
        if !identity.is_valid() {
            return Err(TransportError::InvalidId);
        }
        if self.owners.contains_key(&identity) {
            return Err(TransportError::UnavailableId);
        }
        let entry = self
            .sessions
            .get_mut(&session)
            .ok_or(TransportError::Disconnected)?;

        entry.identities.push(identity.clone());
        debug!("Session {} registered {}", session, identity);
        self.owners.insert(identity, session);
        Ok(())
    }

    /// Releases `identity` and closes every channel it took part in.
    /// Both ends of those channels are told.
    pub fn unregister(&mut self, session: SessionId, identity: &PeerId) -> Vec<Delivery> {
        if self.owners.get(identity) != Some(&session) {
            return Vec::new();
        }
        self.owners.remove(identity);
        if let Some(entry) = self.sessions.get_mut(&session) {
            entry.identities.retain(|owned| owned != identity);
        }
        debug!("Session {} unregistered {}", session, identity);

        let doomed: Vec<ChannelId> = self
            .channels
            .values()
            .filter(|c| c.involves(session, identity))
            .map(|c| c.id)
            .collect();
        self.close_channels(&doomed, None)
    }

    /// Opens a channel from `from` (owned by `session`) to the owner of `to`.
    ///
    /// Returns the channel and the listening session.
    pub fn open_channel(
        &mut self,
        session: SessionId,
        from: &PeerId,
        to: &PeerId,
    ) -> Result<(ChannelId, SessionId), TransportError> {
        if self.owners.get(from) != Some(&session) {
            return Err(TransportError::InvalidId);
        }
        let listener = match self.owners.get(to) {
            Some(owner) if *owner != session => *owner,
            _ => return Err(TransportError::PeerUnavailable),
        };

        let id = self.next_channel_id;
        self.next_channel_id += 1;
        self.channels.insert(
            id,
            Channel {
                id,
                dialer: session,
                from: from.clone(),
                listener,
                to: to.clone(),
            },
        );
        debug!("Channel {}: {} -> {}", id, from, to);
        Ok((id, listener))
    }

    /// The session data on `channel` from `session` must be forwarded to
    pub fn route(&self, session: SessionId, channel: ChannelId) -> Option<SessionId> {
        self.channels.get(&channel)?.other_end(session)
    }

    /// Closes a channel at one end's request, returning the end to notify
    pub fn close_channel(&mut self, session: SessionId, channel: ChannelId) -> Option<SessionId> {
        let remote = self.channels.get(&channel)?.other_end(session)?;
        self.channels.remove(&channel);
        Some(remote)
    }

    fn close_channels(&mut self, ids: &[ChannelId], skip: Option<SessionId>) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        for id in ids {
            if let Some(channel) = self.channels.remove(id) {
                for end in [channel.dialer, channel.listener] {
                    if Some(end) != skip {
                        deliveries.push(Delivery {
                            session: end,
                            packet: Packet::ChannelClosed { channel: *id },
                        });
                    }
                }
            }
        }
        deliveries
    }

    pub fn owner_of(&self, identity: &PeerId) -> Option<SessionId> {
        self.owners.get(identity).copied()
    }

    pub fn session(&self, session: SessionId) -> Option<&Session> {
        self.sessions.get(&session)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
