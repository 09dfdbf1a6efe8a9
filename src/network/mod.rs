//! Network Layer
//!
//! WebSocket RPC between game clients and the sync server. The server side
//! only translates frames into authority calls; all state lives in
//! `authority/`.

pub mod client;
pub mod connection;
pub mod poller;
pub mod protocol;
pub mod retry;
pub mod server;

pub use client::{ClientConfig, ClientError, CommandDispatcher};
pub use connection::{Connection, TransportError};
pub use poller::{remote_players, PollerHandle, StatePoller};
pub use protocol::{
    ClientMessage, Command, CommandReply, CommandRequest, PlayerSnapshot, RegisterPayload,
    ServerMessage, StateReply, StateRequest, UpdatePosPayload,
};
pub use retry::{RetryPolicy, Retryable};
pub use server::{ServerConfig, SyncServer, SyncServerError};
