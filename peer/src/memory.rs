//! In-process transport for swarms of lobbies inside one test or binary
//!
//! A [`MemoryNetwork`] is a shared hub. Each call to
//! [`MemoryNetwork::endpoint`] yields a [`MemoryTransport`] standing in for one
//! process, plus the receiver its events arrive on. Identity ownership is
//! exclusive across the hub, exactly like the rendezvous broker. Dropping an
//! endpoint behaves like the process dying: its identities are freed and
//! every remote end of its connections sees `Closed`.

use crate::transport::{ConnId, Transport, TransportEvent};
use log::{debug, trace};
use shared::{check_message_size, Message, PeerId, TransportError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

type EndpointId = u64;

#[derive(Debug)]
struct End {
    endpoint: EndpointId,
    /// The identity this end speaks as
    identity: PeerId,
    remote: ConnId,
}

#[derive(Debug, Default)]
struct Hub {
    endpoints: HashMap<EndpointId, UnboundedSender<TransportEvent>>,
    owners: HashMap<PeerId, EndpointId>,
    ends: HashMap<ConnId, End>,
    next_endpoint: EndpointId,
    next_conn: u64,
}

impl Hub {
    fn notify(&self, endpoint: EndpointId, event: TransportEvent) {
        if let Some(tx) = self.endpoints.get(&endpoint) {
            if tx.send(event).is_err() {
                trace!("Endpoint {} no longer reading events", endpoint);
            }
        }
    }

    fn alloc_conn(&mut self) -> ConnId {
        self.next_conn += 1;
        ConnId(self.next_conn)
    }

    /// Removes both ends of the connection and tells the far side
    fn sever(&mut self, conn: ConnId) {
        if let Some(end) = self.ends.remove(&conn) {
            if let Some(remote) = self.ends.remove(&end.remote) {
                self.notify(remote.endpoint, TransportEvent::Closed { conn: end.remote });
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds a participant to the network
    pub fn endpoint(&self) -> (MemoryTransport, UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut hub = self.lock();
        hub.next_endpoint += 1;
        let endpoint = hub.next_endpoint;
        hub.endpoints.insert(endpoint, tx);

        let transport = MemoryTransport {
            network: self.clone(),
            endpoint,
        };
        (transport, rx)
    }

    /// Whether any endpoint currently owns `identity`
    pub fn is_owned(&self, identity: &PeerId) -> bool {
        self.lock().owners.contains_key(identity)
    }

    /// Number of live connections, counting each end once
    pub fn connection_count(&self) -> usize {
        self.lock().ends.len() / 2
    }
}

/// One participant's handle on a [`MemoryNetwork`]
#[derive(Debug)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    endpoint: EndpointId,
}

impl Transport for MemoryTransport {
    fn listen(&mut self, identity: &PeerId) {
        let mut hub = self.network.lock();
        let event = if !identity.is_valid() {
            TransportEvent::ListenFailed {
                identity: identity.clone(),
                error: TransportError::InvalidId,
            }
        } else if hub.owners.contains_key(identity) {
            TransportEvent::ListenFailed {
                identity: identity.clone(),
                error: TransportError::UnavailableId,
            }
        } else {
            hub.owners.insert(identity.clone(), self.endpoint);
            debug!("Endpoint {} now owns {}", self.endpoint, identity);
            TransportEvent::Listening {
                identity: identity.clone(),
            }
        };
        hub.notify(self.endpoint, event);
    }

    fn unlisten(&mut self, identity: &PeerId) {
        let mut hub = self.network.lock();
        if hub.owners.get(identity) != Some(&self.endpoint) {
            return;
        }
        hub.owners.remove(identity);
        debug!("Endpoint {} released {}", self.endpoint, identity);

        let accepted: Vec<ConnId> = hub
            .ends
            .iter()
            .filter(|(_, end)| end.endpoint == self.endpoint && end.identity == *identity)
            .map(|(conn, _)| *conn)
            .collect();
        for conn in accepted {
            hub.sever(conn);
        }
    }

    fn connect(&mut self, from: &PeerId, to: &PeerId) -> ConnId {
        let mut hub = self.network.lock();
        let conn = hub.alloc_conn();

        let target = match hub.owners.get(to) {
            Some(target) if *target != self.endpoint => *target,
            _ => {
                hub.notify(
                    self.endpoint,
                    TransportEvent::Error {
                        conn: Some(conn),
                        error: TransportError::PeerUnavailable,
                    },
                );
                return conn;
            }
        };

        let remote = hub.alloc_conn();
        hub.ends.insert(
            conn,
            End {
                endpoint: self.endpoint,
                identity: from.clone(),
                remote,
            },
        );
        hub.ends.insert(
            remote,
            End {
                endpoint: target,
                identity: to.clone(),
                remote: conn,
            },
        );

        hub.notify(
            target,
            TransportEvent::Incoming {
                conn: remote,
                local: to.clone(),
                remote: from.clone(),
            },
        );
        hub.notify(self.endpoint, TransportEvent::Opened { conn });
        conn
    }

    fn send(&mut self, conn: ConnId, message: &Message) -> Result<(), TransportError> {
        let hub = self.network.lock();
        let end = match hub.ends.get(&conn) {
            Some(end) if end.endpoint == self.endpoint => end,
            _ => return Err(TransportError::Disconnected),
        };
        let remote = hub
            .ends
            .get(&end.remote)
            .ok_or(TransportError::Disconnected)?;
        check_message_size(message)?;

        hub.notify(
            remote.endpoint,
            TransportEvent::Data {
                conn: end.remote,
                message: message.clone(),
            },
        );
        Ok(())
    }

    fn close(&mut self, conn: ConnId) {
        let mut hub = self.network.lock();
        if hub.ends.get(&conn).map(|end| end.endpoint) == Some(self.endpoint) {
            hub.sever(conn);
        }
    }

    fn is_open(&self, conn: ConnId) -> bool {
        let hub = self.network.lock();
        hub.ends
            .get(&conn)
            .is_some_and(|end| end.endpoint == self.endpoint)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        let mut hub = self.network.lock();
        let endpoint = self.endpoint;

        hub.owners.retain(|_, owner| *owner != endpoint);
        let owned: Vec<ConnId> = hub
            .ends
            .iter()
            .filter(|(_, end)| end.endpoint == endpoint)
            .map(|(conn, _)| *conn)
            .collect();
        for conn in owned {
            hub.sever(conn);
        }
        hub.endpoints.remove(&endpoint);
        debug!("Endpoint {} left the network", endpoint);
    }
}
