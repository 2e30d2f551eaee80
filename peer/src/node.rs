//! Async event loop driving a [`Lobby`]
//!
//! The node is the single thread of control for one process: it owns the
//! lobby and feeds it transport events, application commands, timer
//! expirations and supervisor ticks one at a time. Timers requested by the
//! lobby become short-lived sleeper tasks that post back into the loop.

use crate::config::LobbyConfig;
use crate::error::ConfigError;
use crate::lobby::{Command, Event, Lobby, LobbySnapshot, Output, Timer};
use crate::relay::Throttle;
use crate::transport::{Transport, TransportEvent};
use log::{debug, info, trace, warn};
use shared::{Message, PeerId};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::time::{interval, sleep, MissedTickBehavior};

/// Requests accepted by a running node
#[derive(Debug)]
pub enum NodeCommand {
    Chat(String),
    PlayerState(Vec<u8>),
    TerrainState(Vec<u8>),
    Join,
    Reset,
    Snapshot(oneshot::Sender<LobbySnapshot>),
    Shutdown,
}

/// Notifications for the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// Chat, player state or terrain state to apply locally
    Delivered(Message),
    Status(String),
    Fatal(String),
    Roster(Vec<PeerId>),
}

/// Cloneable front door to a running [`Node`]
#[derive(Debug, Clone)]
pub struct NodeHandle {
    peer_id: PeerId,
    commands: UnboundedSender<NodeCommand>,
}

impl NodeHandle {
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Queues a command; false once the node has stopped
    pub fn send(&self, command: NodeCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn send_chat(&self, text: impl Into<String>) -> bool {
        self.send(NodeCommand::Chat(text.into()))
    }

    pub fn send_player_state(&self, state: Vec<u8>) -> bool {
        self.send(NodeCommand::PlayerState(state))
    }

    pub fn send_terrain_state(&self, changes: Vec<u8>) -> bool {
        self.send(NodeCommand::TerrainState(changes))
    }

    pub fn request_join(&self) -> bool {
        self.send(NodeCommand::Join)
    }

    pub fn reset(&self) -> bool {
        self.send(NodeCommand::Reset)
    }

    pub fn shutdown(&self) -> bool {
        self.send(NodeCommand::Shutdown)
    }

    pub async fn snapshot(&self) -> Option<LobbySnapshot> {
        let (tx, rx) = oneshot::channel();
        if !self.send(NodeCommand::Snapshot(tx)) {
            return None;
        }
        rx.await.ok()
    }
}

pub struct Node<T: Transport> {
    lobby: Lobby<T>,
    transport_rx: UnboundedReceiver<TransportEvent>,
    command_rx: UnboundedReceiver<NodeCommand>,
    timer_tx: UnboundedSender<Timer>,
    timer_rx: UnboundedReceiver<Timer>,
    app_tx: UnboundedSender<NodeEvent>,
    throttle: Throttle,
    health_interval: Duration,
}

impl<T: Transport> Node<T> {
    /// Builds a node around `transport`; nothing happens until [`run`](Self::run)
    pub fn new(
        identity: PeerId,
        config: LobbyConfig,
        transport: T,
        transport_rx: UnboundedReceiver<TransportEvent>,
    ) -> Result<(Self, NodeHandle, UnboundedReceiver<NodeEvent>), ConfigError> {
        config.validate()?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (app_tx, app_rx) = mpsc::unbounded_channel();

        let handle = NodeHandle {
            peer_id: identity.clone(),
            commands: command_tx,
        };
        let node = Node {
            throttle: Throttle::new(config.state_broadcast_interval),
            health_interval: config.health_interval,
            lobby: Lobby::new(identity, config, transport),
            transport_rx,
            command_rx,
            timer_tx,
            timer_rx,
            app_tx,
        };
        Ok((node, handle, app_rx))
    }

    pub fn lobby(&self) -> &Lobby<T> {
        &self.lobby
    }

    /// Main loop; returns on `Shutdown`, when every handle is dropped, or
    /// when the transport stops producing events
    pub async fn run(mut self) {
        let outputs = self.lobby.start();
        self.apply(outputs);

        let mut health = interval(self.health_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately
        health.tick().await;

        loop {
            tokio::select! {
                event = self.transport_rx.recv() => {
                    match event {
                        Some(event) => self.handle(Event::Transport(event)),
                        None => {
                            warn!("Transport event stream ended");
                            break;
                        }
                    }
                },

                command = self.command_rx.recv() => {
                    match command {
                        Some(NodeCommand::Shutdown) | None => break,
                        Some(command) => self.handle_command(command),
                    }
                },

                Some(timer) = self.timer_rx.recv() => {
                    self.handle(Event::Timer(timer));
                },

                _ = health.tick() => {
                    self.handle(Event::Tick);
                },
            }
        }

        info!("Node {} shutting down", self.lobby.peer_id());
        self.lobby.shutdown();
    }

    fn handle(&mut self, event: Event) {
        let outputs = self.lobby.dispatch(event);
        self.apply(outputs);
    }

    fn handle_command(&mut self, command: NodeCommand) {
        let command = match command {
            NodeCommand::Chat(text) => Command::SendChat { text },
            NodeCommand::PlayerState(state) => {
                if !self.throttle.allow(Instant::now()) {
                    trace!("Player state throttled");
                    return;
                }
                Command::SendPlayerState { state }
            }
            NodeCommand::TerrainState(changes) => Command::SendTerrainState { changes },
            NodeCommand::Join => Command::RequestJoin,
            NodeCommand::Reset => Command::Reset,
            NodeCommand::Snapshot(reply) => {
                let _ = reply.send(self.lobby.snapshot());
                return;
            }
            NodeCommand::Shutdown => return,
        };
        self.handle(Event::Command(command));
    }

    fn apply(&mut self, outputs: Vec<Output>) {
        for output in outputs {
            match output {
                Output::Schedule { after, timer } => {
                    let timer_tx = self.timer_tx.clone();
                    tokio::spawn(async move {
                        sleep(after).await;
                        let _ = timer_tx.send(timer);
                    });
                }
                Output::Deliver(message) => self.emit(NodeEvent::Delivered(message)),
                Output::Status(text) => {
                    info!("{}", text);
                    self.emit(NodeEvent::Status(text));
                }
                Output::Fatal(text) => self.emit(NodeEvent::Fatal(text)),
                Output::RosterChanged(roster) => self.emit(NodeEvent::Roster(roster)),
            }
        }
    }

    fn emit(&self, event: NodeEvent) {
        if self.app_tx.send(event).is_err() {
            debug!("Application stopped listening for node events");
        }
    }
}
