//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Every frame is a JSON text message. Several calls may be in flight on one
//! connection at a time, so each envelope carries the `call_id` the reply is
//! routed back by.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire name of the register command.
pub const REGISTER: &str = "REGISTER";
/// Wire name of the position update command.
pub const UPDATE_POS: &str = "UPDATE_POS";
/// Wire name of the logout command.
pub const LOGOUT: &str = "LOGOUT";

// =============================================================================
// COMMAND PAYLOADS
// =============================================================================

/// Payload validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    /// Register name is empty or whitespace.
    #[error("name must not be empty")]
    EmptyName,

    /// A coordinate or counter is below zero.
    #[error("{field} must not be negative (got {value})")]
    Negative {
        /// Offending field.
        field: &'static str,
        /// Value that was supplied.
        value: i32,
    },
}

fn non_negative(field: &'static str, value: i32) -> Result<(), PayloadError> {
    if value < 0 {
        return Err(PayloadError::Negative { field, value });
    }
    Ok(())
}

/// Payload of a `REGISTER` command.
///
/// Coordinates are optional; a player registered without them spawns at the
/// origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterPayload {
    /// Display name.
    pub name: String,
    /// Spawn column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<i32>,
    /// Spawn row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<i32>,
}

impl RegisterPayload {
    /// Build a validated payload without coordinates.
    pub fn new(name: impl Into<String>) -> Result<Self, PayloadError> {
        let payload = Self { name: name.into(), x: None, y: None };
        payload.validate()?;
        Ok(payload)
    }

    /// Build a validated payload with a spawn position.
    pub fn at(name: impl Into<String>, x: i32, y: i32) -> Result<Self, PayloadError> {
        let payload = Self { name: name.into(), x: Some(x), y: Some(y) };
        payload.validate()?;
        Ok(payload)
    }

    /// Check the payload contract.
    pub fn validate(&self) -> Result<(), PayloadError> {
        if self.name.trim().is_empty() {
            return Err(PayloadError::EmptyName);
        }
        if let Some(x) = self.x {
            non_negative("x", x)?;
        }
        if let Some(y) = self.y {
            non_negative("y", y)?;
        }
        Ok(())
    }

    /// Spawn position, defaulting missing coordinates to zero.
    pub fn position(&self) -> (i32, i32) {
        (self.x.unwrap_or(0), self.y.unwrap_or(0))
    }
}

/// Payload of an `UPDATE_POS` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePosPayload {
    /// Column.
    pub x: i32,
    /// Row.
    pub y: i32,
    /// Remaining lives (the game also uses this as its score counter).
    pub lives: i32,
}

impl UpdatePosPayload {
    /// Build a validated payload.
    pub fn new(x: i32, y: i32, lives: i32) -> Result<Self, PayloadError> {
        let payload = Self { x, y, lives };
        payload.validate()?;
        Ok(payload)
    }

    /// Check the payload contract.
    pub fn validate(&self) -> Result<(), PayloadError> {
        non_negative("x", self.x)?;
        non_negative("y", self.y)?;
        non_negative("lives", self.lives)
    }
}

// =============================================================================
// COMMANDS
// =============================================================================

/// A player command together with its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Join the game.
    Register(RegisterPayload),
    /// Report the current position.
    UpdatePos(UpdatePosPayload),
    /// Leave the game.
    Logout,
    /// A known command whose payload does not have that command's shape.
    ///
    /// Kept so the authority can answer it with a cached `bad-payload`
    /// reply instead of the frame failing to decode.
    Malformed {
        /// Name as sent by the client.
        name: String,
        /// Payload as sent by the client.
        payload: serde_json::Value,
        /// Why the payload did not decode.
        reason: String,
    },
    /// A command name this server does not know. Carries no payload.
    Unknown {
        /// Name as sent by the client.
        name: String,
    },
}

impl Command {
    /// Wire name of the command.
    pub fn name(&self) -> &str {
        match self {
            Command::Register(_) => REGISTER,
            Command::UpdatePos(_) => UPDATE_POS,
            Command::Logout => LOGOUT,
            Command::Malformed { name, .. } | Command::Unknown { name } => name,
        }
    }
}

/// A sequenced command from one client.
///
/// On the wire the command is split into a `command` name and a `payload`
/// whose shape depends on the name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawCommandRequest", into = "RawCommandRequest")]
pub struct CommandRequest {
    /// Client identity.
    pub identity: String,
    /// Per-client sequence number, reused verbatim on retries.
    pub seq: i64,
    /// The command.
    pub command: Command,
}

impl CommandRequest {
    /// Create a request.
    pub fn new(identity: impl Into<String>, seq: i64, command: Command) -> Self {
        Self { identity: identity.into(), seq, command }
    }
}

#[derive(Serialize, Deserialize)]
struct RawCommandRequest {
    identity: String,
    seq: i64,
    command: String,
    #[serde(default)]
    payload: serde_json::Value,
}

impl From<RawCommandRequest> for CommandRequest {
    fn from(raw: RawCommandRequest) -> Self {
        let command = match raw.command.as_str() {
            REGISTER => decode_payload(raw.command, raw.payload, Command::Register),
            UPDATE_POS => decode_payload(raw.command, raw.payload, Command::UpdatePos),
            LOGOUT => Command::Logout,
            _ => Command::Unknown { name: raw.command },
        };

        Self { identity: raw.identity, seq: raw.seq, command }
    }
}

fn decode_payload<P, F>(name: String, payload: serde_json::Value, wrap: F) -> Command
where
    P: serde::de::DeserializeOwned,
    F: FnOnce(P) -> Command,
{
    match P::deserialize(&payload) {
        Ok(decoded) => wrap(decoded),
        Err(e) => Command::Malformed { name, payload, reason: e.to_string() },
    }
}

impl From<CommandRequest> for RawCommandRequest {
    fn from(request: CommandRequest) -> Self {
        let name = request.command.name().to_string();
        let payload = match request.command {
            Command::Register(p) => serde_json::to_value(p),
            Command::UpdatePos(p) => serde_json::to_value(p),
            Command::Malformed { payload, .. } => Ok(payload),
            Command::Logout | Command::Unknown { .. } => Ok(serde_json::Value::Null),
        }
        .unwrap_or(serde_json::Value::Null);

        Self { identity: request.identity, seq: request.seq, command: name, payload }
    }
}

/// Outcome of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandReply {
    /// Sequence number of the command this answers.
    pub seq: i64,
    /// Whether the command changed server state.
    pub applied: bool,
    /// Outcome tag (`registered`, `position-updated`, `bad-payload`, ...).
    pub message: String,
}

// =============================================================================
// STATE QUERY
// =============================================================================

/// State query, carrying no sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRequest {
    /// Identity of the polling client.
    pub identity: String,
    /// Client clock at send time.
    pub client_time: DateTime<Utc>,
}

/// One tracked player as seen by other clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    /// Player identity.
    pub id: String,
    /// Column.
    pub x: i32,
    /// Row.
    pub y: i32,
    /// Remaining lives.
    pub lives: i32,
    /// Last update, unix seconds.
    pub last_seen_unix: i64,
}

/// Snapshot of every tracked player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateReply {
    /// Players ordered by identity.
    pub players: Vec<PlayerSnapshot>,
    /// Server clock, unix seconds.
    pub server_time_unix: i64,
}

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// `SendCommand` procedure.
    SendCommand {
        /// Connection-local call identifier.
        call_id: u64,
        /// The command.
        request: CommandRequest,
    },

    /// `GetState` procedure.
    GetState {
        /// Connection-local call identifier.
        call_id: u64,
        /// The query.
        request: StateRequest,
    },
}

impl ClientMessage {
    /// Call identifier of this message.
    pub fn call_id(&self) -> u64 {
        match self {
            ClientMessage::SendCommand { call_id, .. }
            | ClientMessage::GetState { call_id, .. } => {
                *call_id
            }
        }
    }

    /// Best-effort extraction of `call_id` from a frame that failed to parse.
    pub fn recover_call_id(text: &str) -> Option<u64> {
        let value: serde_json::Value = serde_json::from_str(text).ok()?;
        value.get("call_id")?.as_u64()
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Reply to `SendCommand`.
    CommandReply {
        /// Call being answered.
        call_id: u64,
        /// Command outcome.
        reply: CommandReply,
    },

    /// Reply to `GetState`.
    State {
        /// Call being answered.
        call_id: u64,
        /// Player snapshot.
        reply: StateReply,
    },

    /// The call could not be served.
    Error {
        /// Call being answered, if it could be determined.
        call_id: Option<u64>,
        /// What went wrong.
        error: ServerError,
    },

    /// Server is going away; pending calls will not be answered.
    Shutdown {
        /// Human readable reason.
        reason: String,
    },
}

impl ServerMessage {
    /// Call this message answers, if any.
    pub fn call_id(&self) -> Option<u64> {
        match self {
            ServerMessage::CommandReply { call_id, .. } | ServerMessage::State { call_id, .. } => {
                Some(*call_id)
            }
            ServerMessage::Error { call_id, .. } => *call_id,
            ServerMessage::Shutdown { .. } => None,
        }
    }
}

/// Error report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human readable message.
    pub message: String,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Frame could not be parsed.
    InvalidInput,
    /// Too many connections.
    ServerOverloaded,
    /// Anything else.
    InternalError,
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
