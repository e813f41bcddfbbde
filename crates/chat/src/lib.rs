//! # LanChat Peer Library
//!
//! Everything a LanChat peer runs besides the operator console.
//!
//! ## Overview
//!
//! - **Discovery**: broadcast who we are every few seconds and collect the
//!   announcements of others into a [`PeerDirectory`]
//! - **Connection requests**: ask a peer for a chat; queue the requests others
//!   send us until the operator accepts or rejects them
//! - **Sessions**: one duplex TCP connection per chat, carrying sealed
//!   messages both ways
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          ChatNode                            │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌────────────┐  ┌───────────────────┐  ┌────────────────┐   │
//! │  │ Announcer  │  │ DiscoveryListener │  │ConnectionServer│   │
//! │  └────────────┘  └─────────┬─────────┘  └───────┬────────┘   │
//! │                            │                    │            │
//! │                  ┌─────────▼─────────┐  ┌───────▼────────┐   │
//! │                  │   PeerDirectory   │◄─┤ SessionManager │   │
//! │                  └───────────────────┘  └────────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chat::{ChatNode, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let mut node = ChatNode::new(config, "alice")?;
//!     node.start().await?;
//!
//!     let mut events = node.subscribe();
//!     while let Ok(event) = events.recv().await {
//!         println!("{}", event);
//!     }
//!
//!     node.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`directory`]: Known peers, pending requests, message counters
//! - [`discovery`]: Announcer and discovery listener
//! - [`server`]: Inbound connection classification
//! - [`session`]: Chat sessions and the interactive send loop
//! - [`events`]: Operator notifications
//! - [`node`]: Service wiring and shutdown

pub mod config;
pub mod directory;
pub mod discovery;
pub mod events;
pub mod node;
pub mod server;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;
pub use directory::{ConnectionRequest, DirectoryError, MessageStats, PeerDirectory, PeerRecord};
pub use discovery::{Announcer, DiscoveryListener, ANNOUNCE_INTERVAL};
pub use events::ChatEvent;
pub use node::{ChatNode, NodeState};
pub use server::ConnectionServer;
pub use session::{
    ActionSource, Decision, Direction, PeerSelector, Session, SessionAction, SessionError,
    SessionId, SessionInfo, SessionManager,
};
