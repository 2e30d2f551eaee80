//! # Lobby Peer Library
//!
//! This library implements the peer side of a self-organising lobby system.
//! Every process runs the same code; there is no central game server. Peers
//! elect a host among themselves, the host fills a fixed-size lobby, and once
//! the lobby is complete the next wave of peers forms a new one.
//!
//! ## Core Responsibilities
//!
//! ### Host Election
//! All peers race to bind a single well-known rendezvous identity. The
//! transport guarantees that at most one process owns an identity at a time,
//! so exactly one contender wins and becomes the host. There is no voting and
//! no quorum: the single-owner guarantee is the only election primitive.
//!
//! ### Lobby Formation
//! Losers open a short-lived discovery connection to the rendezvous identity,
//! get redirected to the host's own identity and ask to join. The host admits
//! peers in arrival order until the lobby reaches its target size, announces
//! the final roster to everyone, and after a grace period gives the rendezvous
//! identity back so a new lobby can form around it.
//!
//! ### Message Relay
//! The lobby is a star: clients only talk to the host, and the host forwards
//! chat, player state and terrain state to every other member. Loop
//! suppression keeps a message from bouncing back to its origin.
//!
//! ### Self-Healing
//! Rejections back off with growing delays and a long cooldown, a lost host
//! triggers a full reset and re-election, and a periodic supervisor tick
//! catches anything the event handlers missed.
//!
//! ## Module Organization
//!
//! ### Lobby Module (`lobby`)
//! The state machine. A single `dispatch` entry point consumes events and
//! returns outputs, so all membership changes happen one at a time.
//!
//! ### Identity Module (`identity`)
//! Identity generation and the rendezvous claim lifecycle.
//!
//! ### Membership Module (`membership`)
//! Bounded host-side membership and the identity-to-connection table.
//!
//! ### Relay Module (`relay`)
//! Role-aware message routing, the recent-id window and the send throttle.
//!
//! ### Supervisor Module (`supervisor`)
//! Backoff policy and health verdicts for the periodic tick.
//!
//! ### Transport Modules (`transport`, `memory`, `remote`)
//! The `Transport` trait plus an in-process hub and a TCP broker client.
//!
//! ### Node Module (`node`)
//! The tokio event loop that owns a lobby and talks to the application.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use peer::config::LobbyConfig;
//! use peer::identity::generate_identity;
//! use peer::node::{Node, NodeEvent};
//! use peer::remote::BrokerTransport;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (transport, events) = BrokerTransport::connect("127.0.0.1:9000").await?;
//!     let (node, handle, mut updates) =
//!         Node::new(generate_identity(), LobbyConfig::default(), transport, events)?;
//!     tokio::spawn(node.run());
//!
//!     handle.send_chat("hello lobby");
//!     while let Some(update) = updates.recv().await {
//!         if let NodeEvent::Status(text) = update {
//!             println!("{}", text);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod chat;
pub mod config;
pub mod error;
pub mod identity;
pub mod lobby;
pub mod membership;
pub mod memory;
pub mod node;
pub mod relay;
pub mod remote;
pub mod supervisor;
pub mod transport;
