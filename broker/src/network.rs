//! Broker network layer: TCP accept loop and packet dispatch

use crate::registry::{Delivery, Registry, SessionId};
use log::{debug, error, info, warn};
use shared::{read_packet, write_packet, FrameError, Packet, TransportError};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

/// How long a turned-away connection gets to send its registration
const TURN_AWAY_TIMEOUT: Duration = Duration::from_secs(2);

/// Messages sent from session tasks to the main broker loop
#[derive(Debug)]
pub enum BrokerMessage {
    PacketReceived {
        session: SessionId,
        packet: Packet,
    },
    SessionClosed {
        session: SessionId,
    },
    Shutdown,
}

/// Stops a running [`Broker`] from another task
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    broker_tx: mpsc::UnboundedSender<BrokerMessage>,
}

impl BrokerHandle {
    pub fn shutdown(&self) {
        if self.broker_tx.send(BrokerMessage::Shutdown).is_err() {
            debug!("Broker already stopped");
        }
    }
}

/// Rendezvous broker: owns identity registration and relays channel traffic
pub struct Broker {
    listener: TcpListener,
    registry: Registry,
    writers: HashMap<SessionId, mpsc::UnboundedSender<Packet>>,

    // Communication channels
    broker_tx: mpsc::UnboundedSender<BrokerMessage>,
    broker_rx: mpsc::UnboundedReceiver<BrokerMessage>,
}

impl Broker {
    pub async fn bind(addr: &str, max_sessions: usize) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(addr).await?;
        info!("Broker listening on {}", listener.local_addr()?);

        let (broker_tx, broker_rx) = mpsc::unbounded_channel();

        Ok(Broker {
            listener,
            registry: Registry::new(max_sessions),
            writers: HashMap::new(),
            broker_tx,
            broker_rx,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle {
            broker_tx: self.broker_tx.clone(),
        }
    }

    /// Main broker loop accepting sessions and dispatching their packets
    pub async fn run(mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!("Broker started successfully");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => self.accept(stream, addr),
                        Err(e) => {
                            error!("Error accepting connection: {}", e);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    }
                },

                message = self.broker_rx.recv() => {
                    match message {
                        Some(BrokerMessage::PacketReceived { session, packet }) => {
                            if self.writers.contains_key(&session) {
                                self.handle_packet(session, packet);
                            } else {
                                debug!("Ignoring packet from closed session {}", session);
                            }
                        },
                        Some(BrokerMessage::SessionClosed { session }) => {
                            self.drop_session(session);
                        },
                        Some(BrokerMessage::Shutdown) | None => {
                            info!("Broker shutting down");
                            break;
                        }
                    }
                },
            }
        }

        Ok(())
    }

    fn accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        let Some(session) = self.registry.add_session(addr) else {
            warn!("Rejecting {}: broker is full", addr);
            Self::turn_away(stream, addr);
            return;
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
        }

        let (reader, writer) = stream.into_split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        self.writers.insert(session, writer_tx);

        Self::spawn_session_writer(session, writer, writer_rx, self.broker_tx.clone());
        Self::spawn_session_reader(session, reader, self.broker_tx.clone());
    }

    /// Answers the first registration of a connection the broker has no
    /// room for, then closes it
    fn turn_away(mut stream: TcpStream, addr: SocketAddr) {
        tokio::spawn(async move {
            match timeout(TURN_AWAY_TIMEOUT, read_packet(&mut stream)).await {
                Ok(Ok(Packet::Register { identity })) => {
                    let refusal = Packet::RegisterFailed {
                        identity,
                        reason: TransportError::ServerFull,
                    };
                    if let Err(e) = write_packet(&mut stream, &refusal).await {
                        debug!("Could not tell {} the broker is full: {}", addr, e);
                        return;
                    }
                }
                Ok(Ok(_)) => debug!("{} did not register first", addr),
                Ok(Err(e)) => {
                    debug!("{} went away before registering: {}", addr, e);
                    return;
                }
                Err(_) => debug!("{} sent nothing before being turned away", addr),
            }

            // Half-close and drain so the refusal is not lost to a reset
            if stream.shutdown().await.is_ok() {
                let mut sink = [0u8; 512];
                let drain = async {
                    while let Ok(n) = stream.read(&mut sink).await {
                        if n == 0 {
                            break;
                        }
                    }
                };
                let _ = timeout(TURN_AWAY_TIMEOUT, drain).await;
            }
        });
    }

    /// Spawns task that reads packets from one session
    fn spawn_session_reader(
        session: SessionId,
        mut reader: OwnedReadHalf,
        broker_tx: mpsc::UnboundedSender<BrokerMessage>,
    ) {
        tokio::spawn(async move {
            loop {
                match read_packet(&mut reader).await {
                    Ok(packet) => {
                        if let Err(e) =
                            broker_tx.send(BrokerMessage::PacketReceived { session, packet })
                        {
                            error!("Failed to send packet to main loop: {}", e);
                            return;
                        }
                    }
                    Err(e) => {
                        debug!("Session {} stream ended: {}", session, e);
                        break;
                    }
                }
            }
            let _ = broker_tx.send(BrokerMessage::SessionClosed { session });
        });
    }

    /// Spawns task that drains one session's outgoing queue
    fn spawn_session_writer(
        session: SessionId,
        mut writer: OwnedWriteHalf,
        mut writer_rx: mpsc::UnboundedReceiver<Packet>,
        broker_tx: mpsc::UnboundedSender<BrokerMessage>,
    ) {
        tokio::spawn(async move {
            while let Some(packet) = writer_rx.recv().await {
                match write_packet(&mut writer, &packet).await {
                    Ok(()) => {}
                    Err(FrameError::Io(e)) => {
                        warn!("Failed to write to session {}: {}", session, e);
                        let _ = broker_tx.send(BrokerMessage::SessionClosed { session });
                        break;
                    }
                    Err(e) => warn!("Dropping packet for session {}: {}", session, e),
                }
            }
        });
    }

    fn send(&self, session: SessionId, packet: Packet) {
        match self.writers.get(&session) {
            Some(writer) => {
                if writer.send(packet).is_err() {
                    debug!("Session {} writer is gone", session);
                }
            }
            None => debug!("No writer for session {}", session),
        }
    }

    fn deliver(&self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            self.send(delivery.session, delivery.packet);
        }
    }

    fn drop_session(&mut self, session: SessionId) {
        self.writers.remove(&session);
        let deliveries = self.registry.remove_session(session);
        self.deliver(deliveries);
    }

    /// Applies one packet from `session` to the registry
    fn handle_packet(&mut self, session: SessionId, packet: Packet) {
        match packet {
            Packet::Register { identity } => {
                match self.registry.register(session, identity.clone()) {
                    Ok(()) => self.send(session, Packet::Registered { identity }),
                    Err(reason) => {
                        debug!("Session {} cannot register {}: {}", session, identity, reason);
                        self.send(session, Packet::RegisterFailed { identity, reason });
                    }
                }
            }

            Packet::Unregister { identity } => {
                let deliveries = self.registry.unregister(session, &identity);
                self.deliver(deliveries);
            }

            Packet::Connect { token, from, to } => {
                match self.registry.open_channel(session, &from, &to) {
                    Ok((channel, listener)) => {
                        self.send(
                            listener,
                            Packet::Incoming {
                                channel,
                                local: to,
                                remote: from,
                            },
                        );
                        self.send(session, Packet::ChannelOpened { token, channel });
                    }
                    Err(reason) => {
                        debug!("Session {} cannot reach {}: {}", session, to, reason);
                        self.send(session, Packet::ChannelFailed { token, reason });
                    }
                }
            }

            Packet::Send { channel, message } => match self.registry.route(session, channel) {
                Some(remote) => self.send(remote, Packet::ChannelData { channel, message }),
                None => debug!("Dropping data for unknown channel {}", channel),
            },

            Packet::Close { channel } => {
                if let Some(remote) = self.registry.close_channel(session, channel) {
                    self.send(remote, Packet::ChannelClosed { channel });
                }
            }

            _ => {
                warn!("Unexpected packet type from session {}", session);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{Message, PeerId};

    async fn start() -> (SocketAddr, BrokerHandle) {
        start_with(8).await
    }

    async fn start_with(max_sessions: usize) -> (SocketAddr, BrokerHandle) {
        let broker = Broker::bind("127.0.0.1:0", max_sessions).await.unwrap();
        let addr = broker.local_addr().unwrap();
        let handle = broker.handle();
        tokio::spawn(broker.run());
        (addr, handle)
    }

    async fn send(stream: &mut TcpStream, packet: Packet) {
        write_packet(stream, &packet).await.unwrap();
    }

    async fn recv(stream: &mut TcpStream) -> Packet {
        timeout(Duration::from_secs(2), read_packet(stream))
            .await
            .expect("timed out waiting for broker")
            .unwrap()
    }

    #[test]
    fn test_broker_message_creation() {
        let msg = BrokerMessage::PacketReceived {
            session: 3,
            packet: Packet::Close { channel: 9 },
        };
        match msg {
            BrokerMessage::PacketReceived { session, packet } => {
                assert_eq!(session, 3);
                assert_eq!(packet, Packet::Close { channel: 9 });
            }
            _ => panic!("Unexpected message type"),
        }
    }

    #[tokio::test]
    async fn test_register_is_exclusive() {
        let (addr, handle) = start().await;
        let mut first = TcpStream::connect(addr).await.unwrap();
        let mut second = TcpStream::connect(addr).await.unwrap();
        let rendezvous = PeerId::from("NeonGameBootstrap-2025-001");

        send(&mut first, Packet::Register { identity: rendezvous.clone() }).await;
        assert_eq!(
            recv(&mut first).await,
            Packet::Registered {
                identity: rendezvous.clone()
            }
        );

        send(&mut second, Packet::Register { identity: rendezvous.clone() }).await;
        assert_eq!(
            recv(&mut second).await,
            Packet::RegisterFailed {
                identity: rendezvous,
                reason: TransportError::UnavailableId
            }
        );

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_channel_relay_and_disconnect_cleanup() {
        let (addr, handle) = start().await;
        let mut alice = TcpStream::connect(addr).await.unwrap();
        let mut bob = TcpStream::connect(addr).await.unwrap();
        let a = PeerId::from("ChainNode-a");
        let b = PeerId::from("ChainNode-b");

        send(&mut alice, Packet::Register { identity: a.clone() }).await;
        recv(&mut alice).await;
        send(&mut bob, Packet::Register { identity: b.clone() }).await;
        recv(&mut bob).await;

        send(
            &mut alice,
            Packet::Connect {
                token: 1,
                from: a.clone(),
                to: b.clone(),
            },
        )
        .await;

        let channel = match recv(&mut bob).await {
            Packet::Incoming {
                channel,
                local,
                remote,
            } => {
                assert_eq!(local, b);
                assert_eq!(remote, a);
                channel
            }
            other => panic!("Unexpected packet {:?}", other),
        };
        assert_eq!(
            recv(&mut alice).await,
            Packet::ChannelOpened { token: 1, channel }
        );

        let message = Message::JoinHost { peer_id: a.clone() };
        send(
            &mut alice,
            Packet::Send {
                channel,
                message: message.clone(),
            },
        )
        .await;
        assert_eq!(
            recv(&mut bob).await,
            Packet::ChannelData { channel, message }
        );

        drop(alice);
        assert_eq!(recv(&mut bob).await, Packet::ChannelClosed { channel });

        // The identity is free again once its session is gone
        let mut carol = TcpStream::connect(addr).await.unwrap();
        send(&mut carol, Packet::Register { identity: a.clone() }).await;
        assert_eq!(recv(&mut carol).await, Packet::Registered { identity: a });

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_connect_to_unknown_identity_fails() {
        let (addr, handle) = start().await;
        let mut alice = TcpStream::connect(addr).await.unwrap();
        let a = PeerId::from("ChainNode-a");

        send(&mut alice, Packet::Register { identity: a.clone() }).await;
        recv(&mut alice).await;
        send(
            &mut alice,
            Packet::Connect {
                token: 7,
                from: a,
                to: PeerId::from("ChainNode-ghost"),
            },
        )
        .await;

        assert_eq!(
            recv(&mut alice).await,
            Packet::ChannelFailed {
                token: 7,
                reason: TransportError::PeerUnavailable
            }
        );
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_full_broker_refuses_registration() {
        let (addr, handle) = start_with(1).await;
        let mut first = TcpStream::connect(addr).await.unwrap();
        let a = PeerId::from("ChainNode-a");
        send(&mut first, Packet::Register { identity: a.clone() }).await;
        assert_eq!(recv(&mut first).await, Packet::Registered { identity: a });

        let mut second = TcpStream::connect(addr).await.unwrap();
        let b = PeerId::from("ChainNode-b");
        send(&mut second, Packet::Register { identity: b.clone() }).await;
        assert_eq!(
            recv(&mut second).await,
            Packet::RegisterFailed {
                identity: b,
                reason: TransportError::ServerFull
            }
        );

        // Then the refused connection is closed
        let ended = timeout(Duration::from_secs(2), read_packet(&mut second))
            .await
            .expect("refused connection stayed open");
        assert!(matches!(ended, Err(FrameError::Io(_))));

        handle.shutdown();
    }
}
