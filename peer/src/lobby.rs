//! The lobby state machine
//!
//! [`Lobby`] owns every piece of mutable lobby state: the identity registry,
//! membership, the connection table and the retry counter. It is driven
//! through a single entry point, [`Lobby::dispatch`], which consumes one
//! [`Event`] and returns the [`Output`]s the caller must act on (deliveries to
//! the application, status lines, timers to arm). It never blocks and never
//! sleeps; the [`Node`](crate::node::Node) event loop supplies the clock.
//!
//! ## Phases
//!
//! ```text
//! Offline -> Unelected -+-> HostWaiting -> HostSealed
//!                       |
//!                       +-> Discovering -> ClientConnecting -> ClientPaired
//!
//! any phase -> Resetting -> Unelected
//! ```

use crate::config::LobbyConfig;
use crate::error::ClaimError;
use crate::identity::{message_id, ClaimState, IdentityRegistry};
use crate::membership::{Admission, ConnectionTable, LobbyMembership};
use crate::relay::{self, RecentIds};
use crate::supervisor::{Backoff, Health, Supervisor, Verdict};
use crate::transport::{ConnId, Transport, TransportEvent};
use log::{debug, error, info, warn};
use serde::Serialize;
use shared::{now_millis, ChatEntry, Message, PeerId, TransportError};
use std::collections::HashMap;
use std::time::Duration;

const HOST_FULL_MESSAGE: &str = "Lobby is full, try starting your own lobby";
const RENDEZVOUS_FULL_MESSAGE: &str = "Lobby is full, try again later";
const NOT_HOSTING_MESSAGE: &str = "Not hosting a lobby";

const STATUS_DISCOVERING: &str = "Discovering lobby...";
const STATUS_CONNECTING: &str = "Connecting to host...";
const STATUS_LOBBY_FULL: &str = "Lobby full, starting new lobby...";
const STATUS_ALL_FULL: &str = "All lobbies full, waiting...";
const STATUS_DISCONNECTED: &str = "Lobby disconnected, looking for new lobby...";
const STATUS_DISCOVERY_FAILED: &str = "Failed to discover lobby";
const STATUS_HOST_FAILED: &str = "Failed to connect to host";
const STATUS_NOT_INITIALIZED: &str = "Error: Peer not initialized.";
const STATUS_EMPTY_MESSAGE: &str = "Error: Message cannot be empty.";
const STATUS_NO_CONNECTIONS: &str = "Error: No active connections.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Role {
    Unelected,
    Host,
    Client,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    /// Own identity not registered yet
    Offline,
    /// Claim on the rendezvous identity pending or about to be attempted
    Unelected,
    HostWaiting,
    HostSealed,
    /// `probe` is the transient connection to the rendezvous, once opened
    Discovering { probe: Option<ConnId> },
    ClientConnecting { host_id: PeerId, conn: ConnId },
    ClientPaired { host_id: PeerId, conn: ConnId },
    /// Torn down, waiting to re-elect
    Resetting,
}

impl Phase {
    pub fn role(&self) -> Role {
        match self {
            Phase::HostWaiting | Phase::HostSealed => Role::Host,
            Phase::ClientConnecting { .. } | Phase::ClientPaired { .. } => Role::Client,
            _ => Role::Unelected,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Phase::Offline => "offline",
            Phase::Unelected => "unelected",
            Phase::HostWaiting => "host-waiting",
            Phase::HostSealed => "host-sealed",
            Phase::Discovering { .. } => "discovering",
            Phase::ClientConnecting { .. } => "client-connecting",
            Phase::ClientPaired { .. } => "client-paired",
            Phase::Resetting => "resetting",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Attempt a rendezvous claim
    Elect,
    /// Open the discovery probe
    Discover,
    /// Sealed host gives up the rendezvous identity
    ReleaseRendezvous,
}

/// A delayed wake-up; ignored if the lobby has moved past `epoch`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
    pub kind: TimerKind,
    pub epoch: u64,
}

/// Requests from the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SendChat { text: String },
    SendPlayerState { state: Vec<u8> },
    SendTerrainState { changes: Vec<u8> },
    RequestJoin,
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Transport(TransportEvent),
    Timer(Timer),
    /// Supervisor health tick
    Tick,
    Command(Command),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// Application payload for the local adapter
    Deliver(Message),
    Status(String),
    /// Non-retryable failure
    Fatal(String),
    RosterChanged(Vec<PeerId>),
    Schedule { after: Duration, timer: Timer },
}

/// Read-only view of the lobby for UIs and tests
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LobbySnapshot {
    pub peer_id: PeerId,
    pub role: Role,
    pub phase: &'static str,
    /// Host-side membership, host first; empty on clients
    pub members: Vec<PeerId>,
    /// Other lobby members as seen by this process
    pub roster: Vec<PeerId>,
    pub lobby_full: bool,
    pub holds_rendezvous: bool,
}

/// How an inbound connection reached us
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Inbound {
    /// Through the rendezvous identity; expects a `join`
    Discovery,
    /// Through our own identity; expects a `join_host`
    Member,
}

/// What a connection id means in the current phase
#[derive(Debug, Clone, PartialEq, Eq)]
enum Link {
    Probe,
    Upstream,
    Guest(PeerId),
    Inbound(Inbound),
    Unknown,
}

pub struct Lobby<T: Transport> {
    config: LobbyConfig,
    transport: T,
    registry: IdentityRegistry,
    phase: Phase,
    membership: LobbyMembership,
    table: ConnectionTable,
    inbound: HashMap<ConnId, Inbound>,
    /// Client-side view of the other members, from `host_ready`
    roster: Vec<PeerId>,
    supervisor: Supervisor,
    recent: RecentIds,
    epoch: u64,
    outputs: Vec<Output>,
}

impl<T: Transport> Lobby<T> {
    pub fn new(identity: PeerId, config: LobbyConfig, transport: T) -> Self {
        let registry = IdentityRegistry::new(identity, config.rendezvous_id.clone());
        Self {
            membership: LobbyMembership::new(config.lobby_size),
            supervisor: Supervisor::new(&config),
            recent: RecentIds::new(config.recent_id_capacity),
            config,
            transport,
            registry,
            phase: Phase::Offline,
            table: ConnectionTable::new(),
            inbound: HashMap::new(),
            roster: Vec::new(),
            epoch: 0,
            outputs: Vec::new(),
        }
    }

    /// Registers the own identity; election starts once the transport confirms
    pub fn start(&mut self) -> Vec<Output> {
        info!("Starting peer {}", self.registry.local());
        self.registry.register_local(&mut self.transport);
        self.take_outputs()
    }

    pub fn dispatch(&mut self, event: Event) -> Vec<Output> {
        match event {
            Event::Transport(event) => self.on_transport(event),
            Event::Timer(timer) => self.on_timer(timer),
            Event::Tick => self.on_tick(),
            Event::Command(command) => self.on_command(command),
        }
        self.take_outputs()
    }

    /// Closes every connection and gives up the rendezvous claim
    pub fn shutdown(&mut self) {
        info!("Peer {} leaving", self.registry.local());
        self.teardown();
        self.phase = Phase::Resetting;
        self.bump_epoch();
    }

    pub fn peer_id(&self) -> &PeerId {
        self.registry.local()
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn role(&self) -> Role {
        self.phase.role()
    }

    pub fn config(&self) -> &LobbyConfig {
        &self.config
    }

    pub fn membership(&self) -> &LobbyMembership {
        &self.membership
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn retry_count(&self) -> u32 {
        self.supervisor.retry_count()
    }

    pub fn is_paired(&self) -> bool {
        matches!(self.phase, Phase::ClientPaired { .. })
    }

    pub fn lobby_full(&self) -> bool {
        self.membership.is_full()
    }

    /// Identities of the other lobby members
    pub fn lobby_peer_ids(&self) -> Vec<PeerId> {
        match &self.phase {
            Phase::HostWaiting | Phase::HostSealed => self.membership.guests().to_vec(),
            Phase::ClientPaired { .. } => self.roster.clone(),
            Phase::ClientConnecting { host_id, .. } => vec![host_id.clone()],
            _ => Vec::new(),
        }
    }

    pub fn is_in_complete_lobby(&self) -> bool {
        match self.phase {
            Phase::ClientPaired { .. } => true,
            Phase::HostSealed => self.membership.is_full(),
            _ => false,
        }
    }

    pub fn snapshot(&self) -> LobbySnapshot {
        LobbySnapshot {
            peer_id: self.peer_id().clone(),
            role: self.role(),
            phase: self.phase.name(),
            members: self.membership.members().to_vec(),
            roster: self.lobby_peer_ids(),
            lobby_full: self.membership.is_full(),
            holds_rendezvous: self.registry.holds_rendezvous(),
        }
    }

    pub fn health(&self) -> Health {
        match &self.phase {
            Phase::Offline => Health::Offline,
            Phase::Unelected if self.registry.claim_state() == ClaimState::Released => {
                Health::Idle
            }
            Phase::Unelected | Phase::Discovering { .. } | Phase::Resetting => Health::InFlight,
            Phase::HostWaiting | Phase::HostSealed => Health::Host {
                open: self
                    .table
                    .iter()
                    .filter(|(_, conn)| self.transport.is_open(*conn))
                    .count(),
                total: self.table.len(),
            },
            Phase::ClientConnecting { conn, .. } | Phase::ClientPaired { conn, .. } => {
                Health::Client {
                    host_open: self.transport.is_open(*conn),
                }
            }
        }
    }

    fn take_outputs(&mut self) -> Vec<Output> {
        std::mem::take(&mut self.outputs)
    }

    fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Listening { identity } => {
                if identity == *self.registry.local() {
                    self.on_registered();
                } else if identity == *self.registry.rendezvous() {
                    self.on_claim_result(Ok(()));
                } else {
                    debug!("Ignoring listener confirmation for {}", identity);
                }
            }
            TransportEvent::ListenFailed { identity, error } => {
                if identity == *self.registry.local() {
                    self.fatal(format!("Could not register {}: {}", identity, error));
                } else if identity == *self.registry.rendezvous() {
                    self.on_claim_result(Err(error));
                }
            }
            TransportEvent::Incoming {
                conn,
                local,
                remote,
            } => self.on_incoming(conn, local, remote),
            TransportEvent::Opened { conn } => self.on_opened(conn),
            TransportEvent::Data { conn, message } => self.on_data(conn, message),
            TransportEvent::Closed { conn } => self.on_closed(conn),
            TransportEvent::Error { conn, error } => self.on_error(conn, error),
        }
    }

    fn on_registered(&mut self) {
        if self.registry.is_registered() {
            return;
        }
        self.registry.mark_registered();
        info!("Registered as {}", self.registry.local());
        if self.phase == Phase::Offline {
            self.elect();
        }
    }

    fn on_claim_result(&mut self, result: Result<(), TransportError>) {
        let Some(outcome) = self
            .registry
            .resolve_claim(&mut self.transport, result)
        else {
            return;
        };

        if self.phase != Phase::Unelected {
            if outcome.is_ok() {
                debug!("Claim resolved after leaving election, releasing it");
                self.registry.release(&mut self.transport);
            }
            return;
        }

        match outcome {
            Ok(_) => self.become_host(),
            Err(ClaimError::Contention) => {
                debug!(
                    "Rendezvous {} is taken, discovering its host",
                    self.registry.rendezvous()
                );
                self.phase = Phase::Discovering { probe: None };
                self.status(STATUS_DISCOVERING);
                self.schedule(TimerKind::Discover, self.config.discovery_delay);
            }
            Err(ClaimError::Transport(e)) if e.is_fatal() => {
                self.fatal(format!("Cannot claim rendezvous: {}", e));
            }
            Err(e) => {
                warn!("Rendezvous claim failed: {}", e);
                self.phase = Phase::Discovering { probe: None };
                self.schedule(TimerKind::Discover, self.config.discovery_delay);
            }
        }
    }

    fn on_incoming(&mut self, conn: ConnId, local: PeerId, remote: PeerId) {
        if local == *self.registry.rendezvous() {
            if self.role() == Role::Host {
                debug!("Discovery connection {} from {}", conn, remote);
                self.inbound.insert(conn, Inbound::Discovery);
            } else {
                debug!("Dropping discovery connection from {}", remote);
                self.transport.close(conn);
            }
        } else if local == *self.registry.local() {
            debug!("Incoming connection {} from {}", conn, remote);
            self.inbound.insert(conn, Inbound::Member);
        } else {
            warn!("Connection for unknown identity {} from {}", local, remote);
            self.transport.close(conn);
        }
    }

    fn on_opened(&mut self, conn: ConnId) {
        let own = self.peer_id().clone();
        match self.link_of(conn) {
            Link::Probe => {
                debug!("Discovery probe open, asking for the host");
                self.send(conn, &Message::Join { peer_id: own });
            }
            Link::Upstream => {
                info!("Connected to host, requesting to join");
                self.send(conn, &Message::JoinHost { peer_id: own });
            }
            _ => debug!("Ignoring open of untracked {}", conn),
        }
    }

    fn on_data(&mut self, conn: ConnId, message: Message) {
        match message {
            Message::Join { peer_id } => self.on_discovery_join(conn, peer_id),
            Message::JoinHost { peer_id } => self.on_join_host(conn, peer_id),
            Message::RedirectToHost {
                host_id,
                current_players,
                total_players,
            } => self.on_redirect(conn, host_id, current_players, total_players),
            Message::LobbyFull { message } => self.on_lobby_full(conn, &message),
            Message::Waiting { current, total, .. } => self.on_waiting(conn, current, total),
            Message::HostReady {
                host_id,
                all_players,
            } => self.on_host_ready(conn, host_id, all_players),
            Message::Chat { .. } | Message::PlayerState { .. } | Message::TerrainState { .. } => {
                self.on_app_message(conn, message)
            }
        }
    }

    fn on_closed(&mut self, conn: ConnId) {
        match self.link_of(conn) {
            Link::Inbound(_) => {
                self.inbound.remove(&conn);
            }
            Link::Probe => {
                warn!("Discovery connection closed without a reply");
                self.retry_election(self.config.error_retry_delay);
            }
            Link::Upstream => {
                warn!("Lost connection to host");
                self.reset_and_rejoin(STATUS_DISCONNECTED);
            }
            Link::Guest(peer) => {
                self.table.remove_conn(conn);
                self.on_guest_left(peer);
            }
            Link::Unknown => debug!("Close of untracked {}", conn),
        }
    }

    fn on_error(&mut self, conn: Option<ConnId>, error: TransportError) {
        if error.is_fatal() {
            self.fatal(format!("Transport error: {}", error));
            return;
        }

        match conn.map(|c| (c, self.link_of(c))) {
            Some((conn, Link::Probe)) => {
                warn!("Discovery connection error: {}", error);
                self.transport.close(conn);
                self.status(STATUS_DISCOVERY_FAILED);
                self.retry_election(self.config.error_retry_delay);
            }
            Some((_, Link::Upstream)) => {
                // The supervisor tick notices the dead link and rejoins
                warn!("Host connection error: {}", error);
                self.status(STATUS_HOST_FAILED);
            }
            Some((conn, _)) => warn!("Error on {}: {}", conn, error),
            None => warn!("Transport error, keeping current state: {}", error),
        }
    }

    fn become_host(&mut self) {
        self.phase = Phase::HostWaiting;
        self.bump_epoch();
        self.supervisor.on_settled();
        self.membership.seed(self.peer_id().clone());
        self.table.drain();
        self.roster.clear();

        info!(
            "Claimed {}, hosting a {}-player lobby",
            self.registry.rendezvous(),
            self.config.lobby_size
        );
        self.status(format!(
            "Waiting for {} players... (1/{})",
            self.config.lobby_size, self.config.lobby_size
        ));
        self.roster_changed();
    }

    fn on_discovery_join(&mut self, conn: ConnId, peer_id: PeerId) {
        if self.inbound.get(&conn) != Some(&Inbound::Discovery) {
            warn!("Discovery request from {} on {} ignored", peer_id, conn);
            return;
        }
        self.inbound.remove(&conn);

        if self.role() == Role::Host && !self.membership.is_full() {
            info!(
                "Redirecting {} to this host ({}/{})",
                peer_id,
                self.membership.len(),
                self.membership.target()
            );
            let redirect = Message::RedirectToHost {
                host_id: self.peer_id().clone(),
                current_players: self.membership.len(),
                total_players: self.membership.target(),
            };
            self.send(conn, &redirect);
        } else {
            info!("Lobby complete, turning away discovery from {}", peer_id);
            self.send(
                conn,
                &Message::LobbyFull {
                    message: RENDEZVOUS_FULL_MESSAGE.to_string(),
                },
            );
        }
        self.close_link(conn);
    }

    fn on_join_host(&mut self, conn: ConnId, peer_id: PeerId) {
        match self.table.peer_of(conn) {
            Some(seated) if *seated != peer_id => {
                warn!("join_host for {} on {}'s link {} ignored", peer_id, seated, conn);
                return;
            }
            None if !self.inbound.contains_key(&conn) => {
                warn!("join_host from {} on untracked {}", peer_id, conn);
                return;
            }
            _ => {}
        }

        if self.role() != Role::Host {
            info!("Not hosting, turning away {}", peer_id);
            self.send(
                conn,
                &Message::LobbyFull {
                    message: NOT_HOSTING_MESSAGE.to_string(),
                },
            );
            self.close_link(conn);
            return;
        }

        match self.membership.admit(peer_id.clone()) {
            Admission::Rejected { current, total } => {
                info!("Lobby full ({}/{}), rejecting {}", current, total, peer_id);
                self.send(
                    conn,
                    &Message::LobbyFull {
                        message: HOST_FULL_MESSAGE.to_string(),
                    },
                );
                self.close_link(conn);
            }
            Admission::Duplicate { current, total } => {
                self.reseat(peer_id.clone(), conn);
                if self.membership.is_full() {
                    debug!("{} already in the sealed lobby, repeating host_ready", peer_id);
                    let ready = Message::HostReady {
                        host_id: self.peer_id().clone(),
                        all_players: self.membership.members().to_vec(),
                    };
                    self.send(conn, &ready);
                } else {
                    debug!("{} already in the lobby, repeating waiting", peer_id);
                    let waiting = Message::Waiting {
                        current,
                        total,
                        message: format!(
                            "Already connected - waiting for {} more player(s)",
                            self.membership.remaining()
                        ),
                    };
                    self.send(conn, &waiting);
                }
            }
            Admission::Added { current, total } => {
                self.inbound.remove(&conn);
                self.table.insert(peer_id.clone(), conn);
                info!("Player {}/{} joined: {}", current, total, peer_id);

                let waiting = Message::Waiting {
                    current,
                    total,
                    message: format!(
                        "Waiting for {} more player(s)",
                        self.membership.remaining()
                    ),
                };
                self.send(conn, &waiting);
                self.status(format!(
                    "Waiting for {} players... ({}/{})",
                    total, current, total
                ));
                self.roster_changed();
            }
            Admission::Sealed { members } => {
                self.inbound.remove(&conn);
                self.table.insert(peer_id, conn);
                self.seal(members);
            }
        }
    }

    /// Points a member's table entry at `conn`, closing the link it replaces
    fn reseat(&mut self, peer: PeerId, conn: ConnId) {
        if self.table.conn_of(&peer) == Some(conn) {
            return;
        }
        self.inbound.remove(&conn);
        if let Some(old) = self.table.insert(peer.clone(), conn) {
            debug!("{} moved from {} to {}", peer, old, conn);
            self.transport.close(old);
        }
    }

    fn seal(&mut self, members: Vec<PeerId>) {
        self.phase = Phase::HostSealed;
        info!(
            "Lobby complete with {} players: {:?}",
            members.len(),
            members.iter().map(PeerId::as_str).collect::<Vec<_>>()
        );

        let ready = Message::HostReady {
            host_id: self.peer_id().clone(),
            all_players: members,
        };
        let guests: Vec<ConnId> = self.table.iter().map(|(_, conn)| conn).collect();
        for conn in guests {
            self.send(conn, &ready);
        }

        self.status(format!(
            "Hosting {}-player lobby! (1 host + {} clients)",
            self.config.lobby_size,
            self.config.lobby_size - 1
        ));
        self.roster_changed();
        self.schedule(TimerKind::ReleaseRendezvous, self.config.release_grace);
    }

    fn on_guest_left(&mut self, peer: PeerId) {
        let Some(reopened) = self.membership.remove(&peer) else {
            return;
        };
        info!(
            "{} left, lobby now {}/{}",
            peer,
            self.membership.len(),
            self.membership.target()
        );

        if reopened {
            // Also cancels a pending rendezvous release
            self.phase = Phase::HostWaiting;
            self.bump_epoch();
            info!("Lobby reopened for new players");
        }
        self.status(format!(
            "Waiting for {} players... ({}/{})",
            self.membership.target(),
            self.membership.len(),
            self.membership.target()
        ));
        self.roster_changed();
    }

    fn release_rendezvous(&mut self) {
        if self.registry.release(&mut self.transport) {
            info!(
                "Released {} so a new lobby can form",
                self.registry.rendezvous()
            );
        }
        let discovery: Vec<ConnId> = self
            .inbound
            .iter()
            .filter(|(_, kind)| **kind == Inbound::Discovery)
            .map(|(conn, _)| *conn)
            .collect();
        for conn in discovery {
            self.inbound.remove(&conn);
            self.transport.close(conn);
        }
    }

    fn elect(&mut self) {
        self.close_probe();
        self.phase = Phase::Unelected;
        match self.registry.claim_rendezvous(&mut self.transport) {
            Ok(()) => debug!("Claiming {}", self.registry.rendezvous()),
            Err(e) => debug!("Election skipped: {}", e),
        }
    }

    fn discover(&mut self) {
        self.close_probe();
        let probe = self
            .transport
            .connect(self.registry.local(), self.registry.rendezvous());
        debug!("Opening discovery probe {}", probe);
        self.phase = Phase::Discovering { probe: Some(probe) };
        self.status(STATUS_DISCOVERING);
    }

    fn close_probe(&mut self) {
        if let Phase::Discovering { probe: Some(probe) } = self.phase {
            self.transport.close(probe);
            self.phase = Phase::Discovering { probe: None };
        }
    }

    /// Drops back to waiting and re-elects after `delay`
    fn retry_election(&mut self, delay: Duration) {
        self.close_probe();
        self.phase = Phase::Discovering { probe: None };
        self.bump_epoch();
        self.schedule(TimerKind::Elect, delay);
    }

    fn on_redirect(&mut self, conn: ConnId, host_id: PeerId, current: usize, total: usize) {
        if self.link_of(conn) != Link::Probe {
            debug!("Ignoring redirect on {}", conn);
            return;
        }
        self.transport.close(conn);
        info!("Redirected to host {} ({}/{})", host_id, current, total);

        let upstream = self.transport.connect(self.registry.local(), &host_id);
        self.table.drain();
        self.table.insert(host_id.clone(), upstream);
        self.phase = Phase::ClientConnecting {
            host_id,
            conn: upstream,
        };
        self.status(STATUS_CONNECTING);
        self.roster_changed();
    }

    fn on_lobby_full(&mut self, conn: ConnId, message: &str) {
        match self.link_of(conn) {
            Link::Probe => {}
            Link::Upstream if matches!(self.phase, Phase::ClientConnecting { .. }) => {
                self.table.drain();
            }
            _ => {
                debug!("Ignoring lobby_full on {}", conn);
                return;
            }
        }
        self.transport.close(conn);
        self.phase = Phase::Discovering { probe: None };
        self.bump_epoch();
        info!("Turned away: {}", message);

        match self.supervisor.on_lobby_full() {
            Backoff::Retry { attempt, delay } => {
                info!(
                    "Starting a new lobby attempt {}/{} in {:?}",
                    attempt,
                    self.supervisor.policy().max_retries,
                    delay
                );
                self.status(STATUS_LOBBY_FULL);
                self.schedule(TimerKind::Elect, delay);
            }
            Backoff::Cooldown { delay } => {
                warn!("Too many full lobbies, cooling down for {:?}", delay);
                self.status(STATUS_ALL_FULL);
                self.schedule(TimerKind::Elect, delay);
            }
        }
        self.roster_changed();
    }

    fn on_waiting(&mut self, conn: ConnId, current: usize, total: usize) {
        if self.link_of(conn) != Link::Upstream {
            return;
        }
        debug!("Queued at host ({}/{})", current, total);
        self.status(format!("Waiting in queue... ({}/{})", current, total));
    }

    fn on_host_ready(&mut self, conn: ConnId, host_id: PeerId, all_players: Vec<PeerId>) {
        let expected = match &self.phase {
            Phase::ClientConnecting { host_id, conn: c } if *c == conn => host_id.clone(),
            _ => {
                debug!("Ignoring host_ready on {}", conn);
                return;
            }
        };
        if host_id != expected {
            warn!("host_ready names {} but we joined {}", host_id, expected);
        }

        let own = self.peer_id().clone();
        let total = all_players.len();
        self.roster = all_players.into_iter().filter(|p| *p != own).collect();
        self.phase = Phase::ClientPaired {
            host_id: expected.clone(),
            conn,
        };
        self.bump_epoch();
        self.supervisor.on_settled();

        info!("Paired with host {} in a {}-player lobby", expected, total);
        self.status(format!("Connected to host in {}-player lobby!", total));
        self.roster_changed();
    }

    fn reset_and_rejoin(&mut self, reason: &str) {
        self.teardown();
        self.phase = Phase::Resetting;
        self.bump_epoch();
        info!("Looking for a new {}-player lobby", self.config.lobby_size);
        self.status(reason);
        self.roster_changed();
        self.schedule(TimerKind::Elect, self.config.rejoin_delay);
    }

    fn teardown(&mut self) {
        self.close_probe();
        for (_, conn) in self.table.drain() {
            self.transport.close(conn);
        }
        let inbound: Vec<ConnId> = self.inbound.drain().map(|(conn, _)| conn).collect();
        for conn in inbound {
            self.transport.close(conn);
        }
        self.registry.release(&mut self.transport);
        self.membership.clear();
        self.roster.clear();
    }

    fn on_app_message(&mut self, conn: ConnId, message: Message) {
        let Some(origin) = message.origin().cloned() else {
            return;
        };
        if origin == *self.peer_id() {
            debug!("Dropping own {} echoed back on {}", message.kind(), conn);
            return;
        }
        if !matches!(self.link_of(conn), Link::Upstream | Link::Guest(_)) {
            debug!("Ignoring {} from {} outside the lobby", message.kind(), origin);
            return;
        }

        if let Message::Chat { messages, .. } = &message {
            let mut fresh = false;
            for entry in messages {
                fresh |= self.recent.insert(&entry.id);
            }
            if !fresh {
                debug!("Dropping chat from {} already seen", origin);
                return;
            }
        }

        self.outputs.push(Output::Deliver(message.clone()));
        let report = relay::route(
            &mut self.transport,
            &self.table,
            self.phase.role(),
            &message,
            Some(conn),
        );
        debug!(
            "Relayed {} from {} to {} peer(s)",
            message.kind(),
            origin,
            report.sent
        );
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::SendChat { text } => self.send_chat(&text),
            Command::SendPlayerState { state } => {
                let message = Message::PlayerState {
                    peer_id: self.peer_id().clone(),
                    state,
                    timestamp: now_millis(),
                };
                self.broadcast(&message);
            }
            Command::SendTerrainState { changes } => {
                let message = Message::TerrainState {
                    peer_id: self.peer_id().clone(),
                    changes,
                    timestamp: now_millis(),
                };
                self.broadcast(&message);
            }
            Command::RequestJoin => self.request_join(),
            Command::Reset => {
                if self.phase == Phase::Offline {
                    self.status(STATUS_NOT_INITIALIZED);
                } else {
                    self.reset_and_rejoin(STATUS_DISCONNECTED);
                }
            }
        }
    }

    fn send_chat(&mut self, text: &str) {
        if !self.registry.is_registered() {
            self.status(STATUS_NOT_INITIALIZED);
            return;
        }
        let text = text.trim();
        if text.is_empty() {
            self.status(STATUS_EMPTY_MESSAGE);
            return;
        }

        let own = self.peer_id().clone();
        let timestamp = now_millis();
        let entry = ChatEntry {
            id: message_id(&own, timestamp),
            peer_id: own.clone(),
            text: text.to_string(),
            timestamp,
        };
        self.recent.insert(&entry.id);

        let message = Message::Chat {
            messages: vec![entry],
            from: own,
        };
        self.outputs.push(Output::Deliver(message.clone()));

        let sent = self.broadcast(&message);
        if sent > 0 {
            self.status(format!("Message sent to {} peer(s).", sent));
        } else {
            self.status(STATUS_NO_CONNECTIONS);
        }
    }

    fn broadcast(&mut self, message: &Message) -> usize {
        let report = relay::route(
            &mut self.transport,
            &self.table,
            self.phase.role(),
            message,
            None,
        );
        report.sent
    }

    fn request_join(&mut self) {
        match self.phase {
            Phase::Offline => self.status(STATUS_NOT_INITIALIZED),
            Phase::HostWaiting | Phase::HostSealed | Phase::ClientPaired { .. } => {
                debug!("Already in a lobby, join request ignored");
            }
            Phase::Unelected if self.registry.claim_state() != ClaimState::Released => {
                debug!("Election in progress, join request ignored");
            }
            Phase::ClientConnecting { .. } => debug!("Already joining a host"),
            _ => {
                info!("Join requested, discovering lobby");
                self.bump_epoch();
                self.discover();
            }
        }
    }

    fn on_timer(&mut self, timer: Timer) {
        if timer.epoch != self.epoch {
            debug!("Dropping stale {:?} timer", timer.kind);
            return;
        }

        match timer.kind {
            TimerKind::Elect => match self.phase {
                Phase::Unelected | Phase::Discovering { probe: None } | Phase::Resetting => {
                    self.elect()
                }
                _ => debug!("Election timer ignored while {}", self.phase.name()),
            },
            TimerKind::Discover => match self.phase {
                Phase::Discovering { probe: None } => self.discover(),
                _ => debug!("Discovery timer ignored while {}", self.phase.name()),
            },
            TimerKind::ReleaseRendezvous => {
                if self.phase == Phase::HostSealed {
                    self.release_rendezvous();
                }
            }
        }
    }

    fn on_tick(&mut self) {
        let health = self.health();
        match health {
            Health::Host { open, total } => {
                debug!("Health: hosting with {}/{} open connections", open, total)
            }
            Health::Client { host_open } => debug!("Health: host link open = {}", host_open),
            _ => debug!("Health: {}", self.phase.name()),
        }

        match self.supervisor.assess(health) {
            Verdict::Healthy | Verdict::Wait => {}
            Verdict::Rejoin => {
                warn!("Host link is down, starting over");
                self.reset_and_rejoin(STATUS_DISCONNECTED);
            }
            Verdict::Elect => {
                info!("Not in a lobby, running election");
                self.elect();
            }
        }
    }

    fn link_of(&self, conn: ConnId) -> Link {
        match &self.phase {
            Phase::Discovering { probe: Some(p) } if *p == conn => return Link::Probe,
            Phase::ClientConnecting { conn: c, .. } | Phase::ClientPaired { conn: c, .. }
                if *c == conn =>
            {
                return Link::Upstream
            }
            _ => {}
        }
        if let Some(kind) = self.inbound.get(&conn) {
            return Link::Inbound(*kind);
        }
        match self.table.peer_of(conn) {
            Some(peer) if self.role() == Role::Host => Link::Guest(peer.clone()),
            _ => Link::Unknown,
        }
    }

    /// Closes a link and forgets everything tracked on it.
    ///
    /// Closing locally raises no `Closed` event here, so a guest seated on
    /// the link leaves the lobby right away.
    fn close_link(&mut self, conn: ConnId) {
        self.inbound.remove(&conn);
        self.transport.close(conn);
        if let Some(peer) = self.table.remove_conn(conn) {
            if self.role() == Role::Host {
                self.on_guest_left(peer);
            }
        }
    }

    fn send(&mut self, conn: ConnId, message: &Message) -> bool {
        match self.transport.send(conn, message) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to send {} on {}: {}", message.kind(), conn, e);
                false
            }
        }
    }

    fn bump_epoch(&mut self) {
        self.epoch += 1;
    }

    fn schedule(&mut self, kind: TimerKind, after: Duration) {
        self.outputs.push(Output::Schedule {
            after,
            timer: Timer {
                kind,
                epoch: self.epoch,
            },
        });
    }

    fn status(&mut self, text: impl Into<String>) {
        self.outputs.push(Output::Status(text.into()));
    }

    fn fatal(&mut self, text: String) {
        error!("{}", text);
        self.outputs.push(Output::Fatal(text));
    }

    fn roster_changed(&mut self) {
        let roster = self.lobby_peer_ids();
        self.outputs.push(Output::RosterChanged(roster));
    }
}
