//! # Rendezvous Broker Library
//!
//! This library implements the relay service peers use to find each other.
//! The broker knows nothing about lobbies: it hands out identities, opens
//! channels between them and forwards whatever the peers send.
//!
//! ## Core Responsibilities
//!
//! ### Identity Registration
//! A peer registers one or more identities over its TCP session. Each
//! identity has at most one owner across the whole broker, and a second
//! registration of a taken identity fails with `UnavailableId`. This single
//! guarantee is what lets peers hold an election by racing for one
//! well-known name.
//!
//! ### Channel Relay
//! A peer dials another identity and the broker opens a channel between the
//! two sessions. The listening side learns about it first, then the dialer
//! is told the channel is open. Messages on a channel are forwarded to the
//! other end unchanged.
//!
//! ### Cleanup
//! Releasing an identity closes every channel bound to it. A dropped session
//! frees all of its identities and the surviving end of each of its channels
//! is told the channel closed.
//!
//! ## Module Organization
//!
//! ### Registry Module (`registry`)
//! Plain bookkeeping for sessions, identity owners and channels. Every
//! mutating call returns the packets the network layer has to send.
//!
//! ### Network Module (`network`)
//! TCP accept loop, per-session reader and writer tasks and the single
//! dispatch loop that owns the registry.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use broker::network::Broker;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     // Bind to an address and accept at most 64 peer sessions
//!     let broker = Broker::bind("127.0.0.1:9000", 64)
//!         .await
//!         .map_err(|e| e.to_string())?;
//!
//!     // Runs until a BrokerHandle asks it to stop
//!     broker.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! All packets from all sessions funnel into one loop, so registrations race
//! fairly: whichever `Register` the loop sees first wins.

pub mod network;
pub mod registry;
