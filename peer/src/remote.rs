//! Transport over a TCP connection to the rendezvous broker
//!
//! The broker owns identity registration and relays channel traffic between
//! sessions. This side keeps a small table mapping local [`ConnId`]s to broker
//! [`ChannelId`]s; a writer task drains outgoing packets and a reader task
//! turns broker packets into [`TransportEvent`]s.

use crate::transport::{ConnId, Transport, TransportEvent};
use log::{debug, error, info, warn};
use shared::{
    check_message_size, read_packet, write_packet, ChannelId, FrameError, Message, Packet, PeerId,
    TransportError,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

#[derive(Debug, Default)]
struct ChannelMap {
    next_conn: u64,
    /// Outbound connects awaiting `ChannelOpened`, keyed by token
    pending: HashSet<u64>,
    /// Connects closed locally before the broker answered
    abandoned: HashSet<u64>,
    by_conn: HashMap<ConnId, ChannelId>,
    by_channel: HashMap<ChannelId, ConnId>,
    link_down: bool,
}

impl ChannelMap {
    fn alloc(&mut self) -> ConnId {
        self.next_conn += 1;
        ConnId(self.next_conn)
    }

    fn bind(&mut self, conn: ConnId, channel: ChannelId) {
        self.by_conn.insert(conn, channel);
        self.by_channel.insert(channel, conn);
    }

    fn unbind_conn(&mut self, conn: ConnId) -> Option<ChannelId> {
        let channel = self.by_conn.remove(&conn)?;
        self.by_channel.remove(&channel);
        Some(channel)
    }

    fn unbind_channel(&mut self, channel: ChannelId) -> Option<ConnId> {
        let conn = self.by_channel.remove(&channel)?;
        self.by_conn.remove(&conn);
        Some(conn)
    }
}

type SharedMap = Arc<Mutex<ChannelMap>>;

fn lock(map: &SharedMap) -> MutexGuard<'_, ChannelMap> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Closes every channel along with the broker link.
///
/// Reader and writer both end up here; only the first call reports.
fn link_lost(channels: &SharedMap, events: &UnboundedSender<TransportEvent>) {
    let conns: Vec<ConnId> = {
        let mut map = lock(channels);
        if map.link_down {
            return;
        }
        map.link_down = true;
        map.by_channel.clear();
        map.pending.clear();
        map.by_conn.drain().map(|(conn, _)| conn).collect()
    };
    for conn in conns {
        let _ = events.send(TransportEvent::Closed { conn });
    }
    let _ = events.send(TransportEvent::Error {
        conn: None,
        error: TransportError::Network,
    });
}

pub struct BrokerTransport {
    outbound: UnboundedSender<Packet>,
    channels: SharedMap,
}

impl BrokerTransport {
    /// Connects to the broker and starts the reader and writer tasks
    pub async fn connect(
        addr: &str,
    ) -> Result<(Self, UnboundedReceiver<TransportEvent>), Box<dyn std::error::Error>> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        info!("Connected to broker at {}", addr);

        let (reader, writer) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let channels = SharedMap::default();

        Self::spawn_writer(writer, outbound_rx, Arc::clone(&channels), event_tx.clone());
        Self::spawn_reader(reader, Arc::clone(&channels), event_tx, outbound_tx.clone());

        Ok((
            Self {
                outbound: outbound_tx,
                channels,
            },
            event_rx,
        ))
    }

    /// Spawns task that drains the outgoing packet queue
    fn spawn_writer(
        mut writer: OwnedWriteHalf,
        mut outbound: UnboundedReceiver<Packet>,
        channels: SharedMap,
        events: UnboundedSender<TransportEvent>,
    ) {
        tokio::spawn(async move {
            while let Some(packet) = outbound.recv().await {
                match write_packet(&mut writer, &packet).await {
                    Ok(()) => {}
                    Err(FrameError::Io(e)) => {
                        error!("Failed to write to broker: {}", e);
                        link_lost(&channels, &events);
                        break;
                    }
                    // Nothing reached the stream, the link is fine
                    Err(e) => warn!("Dropping unsendable packet: {}", e),
                }
            }
            debug!("Broker writer stopped");
        });
    }

    /// Spawns task that turns broker packets into transport events
    fn spawn_reader(
        mut reader: OwnedReadHalf,
        channels: SharedMap,
        events: UnboundedSender<TransportEvent>,
        outbound: UnboundedSender<Packet>,
    ) {
        tokio::spawn(async move {
            loop {
                let packet = match read_packet(&mut reader).await {
                    Ok(packet) => packet,
                    Err(e) => {
                        warn!("Lost broker connection: {}", e);
                        break;
                    }
                };

                if let Some(event) = translate(&channels, &outbound, packet) {
                    if events.send(event).is_err() {
                        debug!("Event receiver dropped, stopping broker reader");
                        return;
                    }
                }
            }

            link_lost(&channels, &events);
        });
    }

    fn queue(&self, packet: Packet) -> Result<(), TransportError> {
        self.outbound
            .send(packet)
            .map_err(|_| TransportError::Network)
    }
}

fn translate(
    channels: &SharedMap,
    outbound: &UnboundedSender<Packet>,
    packet: Packet,
) -> Option<TransportEvent> {
    let mut map = lock(channels);
    if map.link_down {
        return None;
    }
    match packet {
        Packet::Registered { identity } => Some(TransportEvent::Listening { identity }),
        Packet::RegisterFailed { identity, reason } => Some(TransportEvent::ListenFailed {
            identity,
            error: reason,
        }),
        Packet::ChannelOpened { token, channel } => {
            if map.abandoned.remove(&token) {
                let _ = outbound.send(Packet::Close { channel });
                return None;
            }
            if !map.pending.remove(&token) {
                warn!("Broker opened channel {} for unknown token {}", channel, token);
                return None;
            }
            let conn = ConnId(token);
            map.bind(conn, channel);
            Some(TransportEvent::Opened { conn })
        }
        Packet::ChannelFailed { token, reason } => {
            map.abandoned.remove(&token);
            if !map.pending.remove(&token) {
                return None;
            }
            Some(TransportEvent::Error {
                conn: Some(ConnId(token)),
                error: reason,
            })
        }
        Packet::Incoming {
            channel,
            local,
            remote,
        } => {
            let conn = map.alloc();
            map.bind(conn, channel);
            Some(TransportEvent::Incoming {
                conn,
                local,
                remote,
            })
        }
        Packet::ChannelData { channel, message } => match map.by_channel.get(&channel) {
            Some(conn) => Some(TransportEvent::Data {
                conn: *conn,
                message,
            }),
            None => {
                debug!("Data for unknown channel {}", channel);
                None
            }
        },
        Packet::ChannelClosed { channel } => map
            .unbind_channel(channel)
            .map(|conn| TransportEvent::Closed { conn }),
        other => {
            warn!("Unexpected packet from broker: {:?}", other);
            None
        }
    }
}

impl Transport for BrokerTransport {
    fn listen(&mut self, identity: &PeerId) {
        if self
            .queue(Packet::Register {
                identity: identity.clone(),
            })
            .is_err()
        {
            warn!("Broker link down, cannot register {}", identity);
        }
    }

    fn unlisten(&mut self, identity: &PeerId) {
        let _ = self.queue(Packet::Unregister {
            identity: identity.clone(),
        });
    }

    fn connect(&mut self, from: &PeerId, to: &PeerId) -> ConnId {
        let conn = {
            let mut map = lock(&self.channels);
            let conn = map.alloc();
            map.pending.insert(conn.0);
            conn
        };
        let request = Packet::Connect {
            token: conn.0,
            from: from.clone(),
            to: to.clone(),
        };
        if self.queue(request).is_err() {
            warn!("Broker link down, cannot reach {}", to);
        }
        conn
    }

    fn send(&mut self, conn: ConnId, message: &Message) -> Result<(), TransportError> {
        let channel = lock(&self.channels)
            .by_conn
            .get(&conn)
            .copied()
            .ok_or(TransportError::Disconnected)?;
        check_message_size(message)?;
        self.queue(Packet::Send {
            channel,
            message: message.clone(),
        })
    }

    fn close(&mut self, conn: ConnId) {
        let channel = {
            let mut map = lock(&self.channels);
            if map.pending.remove(&conn.0) {
                map.abandoned.insert(conn.0);
                None
            } else {
                map.unbind_conn(conn)
            }
        };
        if let Some(channel) = channel {
            let _ = self.queue(Packet::Close { channel });
        }
    }

    fn is_open(&self, conn: ConnId) -> bool {
        lock(&self.channels).by_conn.contains_key(&conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    fn fixture() -> (SharedMap, UnboundedSender<Packet>, UnboundedReceiver<Packet>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SharedMap::default(), tx, rx)
    }

    #[test]
    fn test_incoming_binds_a_fresh_conn() {
        let (channels, outbound, _rx) = fixture();
        let event = translate(
            &channels,
            &outbound,
            Packet::Incoming {
                channel: 5,
                local: PeerId::from("B"),
                remote: PeerId::from("A"),
            },
        );

        let conn = match event {
            Some(TransportEvent::Incoming { conn, .. }) => conn,
            other => panic!("Unexpected event {:?}", other),
        };
        assert_eq!(lock(&channels).by_conn.get(&conn), Some(&5));

        let data = translate(
            &channels,
            &outbound,
            Packet::ChannelData {
                channel: 5,
                message: Message::Join {
                    peer_id: PeerId::from("A"),
                },
            },
        );
        assert!(matches!(data, Some(TransportEvent::Data { conn: c, .. }) if c == conn));

        let closed = translate(&channels, &outbound, Packet::ChannelClosed { channel: 5 });
        assert_eq!(closed, Some(TransportEvent::Closed { conn }));
        assert!(lock(&channels).by_conn.is_empty());
    }

    #[test]
    fn test_open_for_pending_token() {
        let (channels, outbound, _rx) = fixture();
        lock(&channels).pending.insert(3);

        let event = translate(
            &channels,
            &outbound,
            Packet::ChannelOpened {
                token: 3,
                channel: 11,
            },
        );
        assert_eq!(event, Some(TransportEvent::Opened { conn: ConnId(3) }));
        assert_eq!(lock(&channels).by_channel.get(&11), Some(&ConnId(3)));
    }

    #[test]
    fn test_abandoned_connect_is_closed_on_open() {
        let (channels, outbound, mut rx) = fixture();
        lock(&channels).abandoned.insert(4);

        let event = translate(
            &channels,
            &outbound,
            Packet::ChannelOpened {
                token: 4,
                channel: 12,
            },
        );
        assert!(event.is_none());
        assert_eq!(rx.try_recv().unwrap(), Packet::Close { channel: 12 });
    }

    #[test]
    fn test_register_failure_maps_to_listen_failed() {
        let (channels, outbound, _rx) = fixture();
        let event = translate(
            &channels,
            &outbound,
            Packet::RegisterFailed {
                identity: PeerId::from("R"),
                reason: TransportError::UnavailableId,
            },
        );
        assert_eq!(
            event,
            Some(TransportEvent::ListenFailed {
                identity: PeerId::from("R"),
                error: TransportError::UnavailableId
            })
        );
    }

    #[test]
    fn test_link_loss_is_reported_once() {
        let (channels, outbound, _rx) = fixture();
        let (events, mut received) = mpsc::unbounded_channel();
        lock(&channels).bind(ConnId(1), 21);
        lock(&channels).bind(ConnId(2), 22);

        link_lost(&channels, &events);
        link_lost(&channels, &events);

        let mut closed = Vec::new();
        let mut errors = 0;
        while let Ok(event) = received.try_recv() {
            match event {
                TransportEvent::Closed { conn } => closed.push(conn),
                TransportEvent::Error { conn: None, .. } => errors += 1,
                other => panic!("Unexpected event {:?}", other),
            }
        }
        closed.sort_by_key(|conn| conn.0);
        assert_eq!(closed, vec![ConnId(1), ConnId(2)]);
        assert_eq!(errors, 1);

        // Packets racing the teardown are ignored
        let late = translate(
            &channels,
            &outbound,
            Packet::Incoming {
                channel: 23,
                local: PeerId::from("B"),
                remote: PeerId::from("A"),
            },
        );
        assert!(late.is_none());
        assert!(lock(&channels).by_conn.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_send_fails_alone() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (mut transport, mut events) = BrokerTransport::connect(&addr).await.unwrap();
        let (mut broker_side, _) = listener.accept().await.unwrap();

        write_packet(
            &mut broker_side,
            &Packet::Incoming {
                channel: 4,
                local: PeerId::from("B"),
                remote: PeerId::from("A"),
            },
        )
        .await
        .unwrap();
        let conn = match timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(TransportEvent::Incoming { conn, .. })) => conn,
            other => panic!("Unexpected event {:?}", other),
        };

        let huge = Message::TerrainState {
            peer_id: PeerId::from("B"),
            changes: vec![0; shared::MAX_FRAME_LEN + 1],
            timestamp: 1,
        };
        assert_eq!(
            transport.send(conn, &huge),
            Err(TransportError::MessageTooLarge)
        );
        assert!(transport.is_open(conn));

        let small = Message::PlayerState {
            peer_id: PeerId::from("B"),
            state: vec![1],
            timestamp: 2,
        };
        assert_eq!(transport.send(conn, &small), Ok(()));
        let relayed = timeout(Duration::from_secs(2), read_packet(&mut broker_side))
            .await
            .expect("timed out waiting for the small message")
            .unwrap();
        assert_eq!(
            relayed,
            Packet::Send {
                channel: 4,
                message: small
            }
        );
    }

    #[test]
    fn test_channel_failure_reports_error_once() {
        let (channels, outbound, _rx) = fixture();
        lock(&channels).pending.insert(6);

        let failure = Packet::ChannelFailed {
            token: 6,
            reason: TransportError::PeerUnavailable,
        };
        assert_eq!(
            translate(&channels, &outbound, failure.clone()),
            Some(TransportEvent::Error {
                conn: Some(ConnId(6)),
                error: TransportError::PeerUnavailable
            })
        );
        assert_eq!(translate(&channels, &outbound, failure), None);
    }
}
