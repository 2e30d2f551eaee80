use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Well-known identity contested by every process during host election.
pub const RENDEZVOUS_ID: &str = "NeonGameBootstrap-2025-001";
/// Namespace prefix for generated peer identities.
pub const PEER_ID_PREFIX: &str = "ChainNode-";
pub const DEFAULT_LOBBY_SIZE: usize = 3;
pub const MAX_IDENTITY_LEN: usize = 64;
/// Upper bound on a single length-prefixed frame (1 MiB).
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Broker-assigned identifier of a logical channel between two identities.
pub type ChannelId = u64;

/// Opaque, globally unique identity of a participant or of the rendezvous point.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Identities are non-empty, bounded, and limited to ASCII
    /// alphanumerics plus `-` and `_` so they survive any transport.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= MAX_IDENTITY_LEN
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A single chat line as displayed by the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEntry {
    /// `<sender>_<millis>_<random>`; unique per sender
    pub id: String,
    pub peer_id: PeerId,
    pub text: String,
    pub timestamp: u64,
}

/// Discriminant of [`Message`], used for logging and routing decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Join,
    JoinHost,
    RedirectToHost,
    Waiting,
    LobbyFull,
    HostReady,
    Chat,
    PlayerState,
    TerrainState,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Join => "join",
            MessageKind::JoinHost => "join_host",
            MessageKind::RedirectToHost => "redirect_to_host",
            MessageKind::Waiting => "waiting",
            MessageKind::LobbyFull => "lobby_full",
            MessageKind::HostReady => "host_ready",
            MessageKind::Chat => "message",
            MessageKind::PlayerState => "player_state",
            MessageKind::TerrainState => "terrain_state",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lobby protocol messages exchanged between participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Client to rendezvous: discovery request.
    Join { peer_id: PeerId },
    /// Rendezvous to client: the lobby's host answers under its real identity.
    RedirectToHost {
        host_id: PeerId,
        current_players: usize,
        total_players: usize,
    },
    /// Rendezvous or host to client; terminal for the current attempt.
    LobbyFull { message: String },
    /// Client to host: membership request.
    JoinHost { peer_id: PeerId },
    /// Host to client: accepted, lobby not complete yet.
    Waiting {
        current: usize,
        total: usize,
        message: String,
    },
    /// Host to every client once the lobby seals.
    HostReady {
        host_id: PeerId,
        all_players: Vec<PeerId>,
    },
    Chat {
        messages: Vec<ChatEntry>,
        from: PeerId,
    },
    PlayerState {
        peer_id: PeerId,
        state: Vec<u8>,
        timestamp: u64,
    },
    TerrainState {
        peer_id: PeerId,
        changes: Vec<u8>,
        timestamp: u64,
    },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Join { .. } => MessageKind::Join,
            Message::RedirectToHost { .. } => MessageKind::RedirectToHost,
            Message::LobbyFull { .. } => MessageKind::LobbyFull,
            Message::JoinHost { .. } => MessageKind::JoinHost,
            Message::Waiting { .. } => MessageKind::Waiting,
            Message::HostReady { .. } => MessageKind::HostReady,
            Message::Chat { .. } => MessageKind::Chat,
            Message::PlayerState { .. } => MessageKind::PlayerState,
            Message::TerrainState { .. } => MessageKind::TerrainState,
        }
    }

    /// Originating participant of an application payload. Control
    /// messages are point-to-point and have no relay origin.
    pub fn origin(&self) -> Option<&PeerId> {
        match self {
            Message::Chat { from, .. } => Some(from),
            Message::PlayerState { peer_id, .. } => Some(peer_id),
            Message::TerrainState { peer_id, .. } => Some(peer_id),
            _ => None,
        }
    }

    pub fn is_relayable(&self) -> bool {
        self.origin().is_some()
    }
}

/// Failure kinds reported by a connection transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
pub enum TransportError {
    #[error("identity is already owned by another participant")]
    UnavailableId,
    #[error("identity is not valid")]
    InvalidId,
    #[error("remote identity is not reachable")]
    PeerUnavailable,
    #[error("network failure")]
    Network,
    #[error("peer is incompatible")]
    Incompatible,
    #[error("broker has no free sessions")]
    ServerFull,
    #[error("connection is not open")]
    Disconnected,
    #[error("message exceeds the frame size limit")]
    MessageTooLarge,
}

impl TransportError {
    /// Temporary conditions the supervisor heals on its own.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TransportError::Network
                | TransportError::PeerUnavailable
                | TransportError::Disconnected
                | TransportError::ServerFull
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Incompatible | TransportError::InvalidId)
    }

    /// Losing a race for an identity; drives the election, not a failure.
    pub fn is_contention(&self) -> bool {
        matches!(self, TransportError::UnavailableId)
    }
}

/// Frames exchanged between a peer process and the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    Register {
        identity: PeerId,
    },
    Unregister {
        identity: PeerId,
    },
    Connect {
        token: u64,
        from: PeerId,
        to: PeerId,
    },
    Send {
        channel: ChannelId,
        message: Message,
    },
    Close {
        channel: ChannelId,
    },

    Registered {
        identity: PeerId,
    },
    RegisterFailed {
        identity: PeerId,
        reason: TransportError,
    },
    ChannelOpened {
        token: u64,
        channel: ChannelId,
    },
    ChannelFailed {
        token: u64,
        reason: TransportError,
    },
    Incoming {
        channel: ChannelId,
        local: PeerId,
        remote: PeerId,
    },
    ChannelData {
        channel: ChannelId,
        message: Message,
    },
    ChannelClosed {
        channel: ChannelId,
    },
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds the frame size limit")]
    TooLarge(usize),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Serializes a packet with its 4-byte big-endian length prefix.
pub fn encode_frame(packet: &Packet) -> Result<Vec<u8>, FrameError> {
    let body = bincode::serialize(packet)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(body.len()));
    }

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Bytes a `Send` or `ChannelData` packet adds around its message: the
/// variant tag and the channel id.
const CHANNEL_PACKET_OVERHEAD: u64 = 4 + 8;

/// Checks that `message` fits in a single channel frame.
///
/// Transports call this before queueing so an oversized message fails its
/// own send instead of reaching the stream writer.
pub fn check_message_size(message: &Message) -> Result<(), TransportError> {
    let size = bincode::serialized_size(message).map_err(|_| TransportError::MessageTooLarge)?;
    if size + CHANNEL_PACKET_OVERHEAD > MAX_FRAME_LEN as u64 {
        return Err(TransportError::MessageTooLarge);
    }
    Ok(())
}

/// Validates a length prefix read off the wire.
pub fn frame_len(header: [u8; 4]) -> Result<usize, FrameError> {
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    Ok(len)
}

pub fn decode_frame(body: &[u8]) -> Result<Packet, FrameError> {
    Ok(bincode::deserialize(body)?)
}

/// Reads one length-prefixed packet from a stream.
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Packet, FrameError> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;
    let len = frame_len(header)?;

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode_frame(&body)
}

pub async fn write_packet<W: AsyncWrite + Unpin>(
    writer: &mut W,
    packet: &Packet,
) -> Result<(), FrameError> {
    let frame = encode_frame(packet)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Milliseconds since the Unix epoch, saturating on clock errors.
pub fn now_millis() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis();
    millis.min(u64::MAX as u128) as u64
}
