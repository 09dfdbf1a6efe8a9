//! # Maze Sync
//!
//! Multiplayer state synchronization for a terminal maze game.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         MAZE SYNC                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  authority/      - Server-side state (exactly-once)          │
//! │  ├── mod.rs      - Command authority, one lock               │
//! │  ├── state.rs    - Player table and dedup cache              │
//! │  └── eviction.rs - Periodic TTL eviction                     │
//! │                                                              │
//! │  network/        - RPC over WebSocket                        │
//! │  ├── protocol.rs - Commands, replies, frame envelopes        │
//! │  ├── server.rs   - WebSocket server                          │
//! │  ├── connection.rs - Multiplexed client connection           │
//! │  ├── client.rs   - Sequenced, retrying dispatcher            │
//! │  ├── retry.rs    - Exponential backoff policy                │
//! │  └── poller.rs   - Periodic remote-player snapshot           │
//! │                                                              │
//! │  identity.rs     - Persistent client identity file           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Exactly-Once Commands
//!
//! Every command carries `(identity, seq)`. The authority stores the reply
//! under that key before releasing its lock, so a retransmission gets the
//! original reply back and never mutates state twice.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod authority;
pub mod identity;
pub mod network;

// Re-export commonly used types
pub use authority::{Authority, AuthorityConfig, EvictionScheduler};
pub use identity::load_or_create_identity;
pub use network::client::{ClientConfig, ClientError, CommandDispatcher};
pub use network::protocol::{Command, CommandReply, CommandRequest, PlayerSnapshot, StateReply};
pub use network::server::{ServerConfig, SyncServer};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
