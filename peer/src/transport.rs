//! The connection capability the lobby core is written against
//!
//! A transport binds identities, opens point-to-point connections between
//! identities and moves [`Message`]s over them. Every call returns
//! immediately; outcomes arrive later as [`TransportEvent`]s on the channel
//! handed out alongside the transport. Two implementations ship with the
//! crate: [`MemoryNetwork`](crate::memory::MemoryNetwork) for in-process swarms
//! and [`BrokerTransport`](crate::remote::BrokerTransport) for real processes
//! meeting at a TCP broker.

use shared::{Message, PeerId, TransportError};
use std::fmt;

/// Process-local handle for one end of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Asynchronous outcomes reported by a transport
///
/// A connection closed locally produces no `Closed` event for the closer;
/// only the remote end is told.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// `listen(identity)` succeeded; inbound connections to it will follow
    Listening { identity: PeerId },
    ListenFailed {
        identity: PeerId,
        error: TransportError,
    },
    /// A remote identity connected to one of our bound identities.
    /// The connection is usable immediately.
    Incoming {
        conn: ConnId,
        local: PeerId,
        remote: PeerId,
    },
    /// An outbound connection from `connect` is ready for `send`
    Opened { conn: ConnId },
    Data { conn: ConnId, message: Message },
    Closed { conn: ConnId },
    /// A failure tied to a connection, or to the transport as a whole
    Error {
        conn: Option<ConnId>,
        error: TransportError,
    },
}

pub trait Transport {
    /// Binds `identity` to this process; at most one owner per identity.
    fn listen(&mut self, identity: &PeerId);

    /// Drops ownership of `identity` and every connection accepted through it.
    fn unlisten(&mut self, identity: &PeerId);

    /// Dials `to` as `from`. The id is valid at once; `Opened` or `Error` follows.
    fn connect(&mut self, from: &PeerId, to: &PeerId) -> ConnId;

    fn send(&mut self, conn: ConnId, message: &Message) -> Result<(), TransportError>;

    fn close(&mut self, conn: ConnId);

    fn is_open(&self, conn: ConnId) -> bool;
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::HashSet;

    /// Records every call so state machine tests can assert on side effects
    #[derive(Debug, Default)]
    pub(crate) struct RecordingTransport {
        pub listens: Vec<PeerId>,
        pub unlistens: Vec<PeerId>,
        pub connects: Vec<(ConnId, PeerId)>,
        pub sent: Vec<(ConnId, Message)>,
        pub closed: Vec<ConnId>,
        pub open: HashSet<ConnId>,
        pub failing: HashSet<ConnId>,
        next_conn: u64,
    }

    impl RecordingTransport {
        pub fn new() -> Self {
            Self {
                next_conn: 100,
                ..Self::default()
            }
        }

        pub fn open_conn(&mut self, conn: ConnId) {
            self.open.insert(conn);
        }

        pub fn last_connect(&self) -> Option<(ConnId, PeerId)> {
            self.connects.last().cloned()
        }

        pub fn sent_to(&self, conn: ConnId) -> Vec<Message> {
            self.sent
                .iter()
                .filter(|(c, _)| *c == conn)
                .map(|(_, m)| m.clone())
                .collect()
        }

        pub fn take_sent(&mut self) -> Vec<(ConnId, Message)> {
            std::mem::take(&mut self.sent)
        }
    }

    impl Transport for RecordingTransport {
        fn listen(&mut self, identity: &PeerId) {
            self.listens.push(identity.clone());
        }

        fn unlisten(&mut self, identity: &PeerId) {
            self.unlistens.push(identity.clone());
        }

        fn connect(&mut self, _from: &PeerId, to: &PeerId) -> ConnId {
            let conn = ConnId(self.next_conn);
            self.next_conn += 1;
            self.connects.push((conn, to.clone()));
            conn
        }

        fn send(&mut self, conn: ConnId, message: &Message) -> Result<(), TransportError> {
            if self.failing.contains(&conn) {
                return Err(TransportError::Network);
            }
            if !self.open.contains(&conn) {
                return Err(TransportError::Disconnected);
            }
            self.sent.push((conn, message.clone()));
            Ok(())
        }

        fn close(&mut self, conn: ConnId) {
            self.open.remove(&conn);
            self.closed.push(conn);
        }

        fn is_open(&self, conn: ConnId) -> bool {
            self.open.contains(&conn)
        }
    }
}
