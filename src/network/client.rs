//! Command Dispatcher
//!
//! Client side of the protocol. Numbers every command, sends it over a
//! shared connection and retries with exponential backoff, reconnecting
//! transparently. A retry reuses the sequence number of the call it retries,
//! which is what lets the server recognise a retransmission.
//!
//! The sequence counter and the connection handle sit behind one mutex.
//! The round trip itself happens outside it, so concurrent callers only
//! serialize on counter increments and connection swaps.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::identity::{load_or_create_identity, IdentityError};
use crate::network::connection::{Connection, TransportError};
use crate::network::protocol::{
    Command, CommandReply, CommandRequest, PayloadError, RegisterPayload, StateReply,
    StateRequest, UpdatePosPayload,
};
use crate::network::retry::{RetryPolicy, Retryable};

/// Default server address.
pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:12345";

/// Shortest accepted polling interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address (`host:port`).
    pub server_addr: String,
    /// Backoff for dialing and for calls.
    pub retry: RetryPolicy,
    /// How long a single call may wait for its reply.
    pub call_timeout: Duration,
    /// Interval between state polls.
    pub poll_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: DEFAULT_SERVER_ADDR.to_string(),
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(300),
        }
    }
}

impl ClientConfig {
    /// Create config from environment variables (`SERVER_ADDR`, `POLL_MS`).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("SERVER_ADDR") {
            if !addr.is_empty() {
                config.server_addr = addr;
            }
        }
        if let Some(ms) = std::env::var("POLL_MS").ok().and_then(|v| v.parse().ok()) {
            config = config.with_poll_millis(ms);
        }
        config
    }

    /// Set the polling interval, ignoring values below the minimum.
    pub fn with_poll_millis(mut self, ms: u64) -> Self {
        let interval = Duration::from_millis(ms);
        if interval >= MIN_POLL_INTERVAL {
            self.poll_interval = interval;
        }
        self
    }
}

/// Errors surfaced to the game loop.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Every dial attempt failed.
    #[error("could not connect to {addr} after {attempts} attempts: {source}")]
    Connect {
        /// Server address.
        addr: String,
        /// Dial attempts made.
        attempts: u32,
        /// Last dial failure.
        #[source]
        source: TransportError,
    },

    /// Every call attempt failed.
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Procedure name.
        operation: &'static str,
        /// Attempts made.
        attempts: u32,
        /// Last failure.
        #[source]
        source: TransportError,
    },

    /// The server refused the call; retrying would not help.
    #[error("{operation} rejected: {source}")]
    Rejected {
        /// Procedure name.
        operation: &'static str,
        /// Server's answer.
        #[source]
        source: TransportError,
    },

    /// The command was built from an invalid payload.
    #[error("invalid payload: {0}")]
    Payload(#[from] PayloadError),

    /// The identity file could not be loaded.
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// Why one attempt inside the send loop failed.
#[derive(Debug)]
enum AttemptError {
    Connect(ClientError),
    Transport(TransportError),
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Connect(e) => write!(f, "{}", e),
            AttemptError::Transport(e) => write!(f, "{}", e),
        }
    }
}

impl Retryable for AttemptError {
    fn is_retryable(&self) -> bool {
        match self {
            // Reconnecting already spent its own retry budget.
            AttemptError::Connect(_) => false,
            AttemptError::Transport(e) => e.is_retryable(),
        }
    }
}

struct Link {
    seq: i64,
    connection: Option<Arc<Connection>>,
}

/// Sequenced, retrying command sender for one client identity.
pub struct CommandDispatcher {
    identity: String,
    config: ClientConfig,
    link: Mutex<Link>,
}

impl CommandDispatcher {
    /// Create a dispatcher whose first command gets sequence number 1.
    pub fn new(identity: impl Into<String>, config: ClientConfig) -> Self {
        Self::starting_after(identity, config, 0)
    }

    /// Create a dispatcher whose first command gets `last_seq + 1`.
    pub fn starting_after(
        identity: impl Into<String>,
        config: ClientConfig,
        last_seq: i64,
    ) -> Self {
        Self {
            identity: identity.into(),
            config,
            link: Mutex::new(Link { seq: last_seq, connection: None }),
        }
    }

    /// Create a dispatcher whose sequence starts at the current unix time in
    /// milliseconds.
    ///
    /// The identity survives restarts but the counter does not; starting from
    /// the clock keeps a restarted client from reusing sequence numbers the
    /// server still has cached.
    pub fn resuming(identity: impl Into<String>, config: ClientConfig) -> Self {
        Self::starting_after(identity, config, Utc::now().timestamp_millis())
    }

    /// Load (or create) the identity stored at `path` and resume with it.
    pub fn from_identity_file(
        path: impl AsRef<std::path::Path>,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let identity = load_or_create_identity(path)?;
        Ok(Self::resuming(identity, config))
    }

    /// Client identity.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Last sequence number handed out.
    pub async fn last_seq(&self) -> i64 {
        self.link.lock().await.seq
    }

    /// True if a live connection is currently held.
    pub async fn is_connected(&self) -> bool {
        let link = self.link.lock().await;
        link.connection.as_ref().is_some_and(|c| !c.is_closed())
    }

    async fn next_seq(&self) -> i64 {
        let mut link = self.link.lock().await;
        link.seq += 1;
        link.seq
    }

    async fn acquire(&self) -> Result<Arc<Connection>, ClientError> {
        let mut link = self.link.lock().await;

        if let Some(connection) = &link.connection {
            if !connection.is_closed() {
                return Ok(connection.clone());
            }
            debug!("Dropping closed connection to {}", connection.addr());
        }
        link.connection = None;

        let addr = self.config.server_addr.as_str();
        let connection = self
            .config
            .retry
            .run("connect", |_| Connection::dial(addr))
            .await
            .map_err(|source| ClientError::Connect {
                addr: addr.to_string(),
                attempts: self.config.retry.max_attempts,
                source,
            })?;

        info!("Connected to {}", addr);
        let connection = Arc::new(connection);
        link.connection = Some(connection.clone());
        Ok(connection)
    }

    async fn discard(&self, connection: &Arc<Connection>) {
        let mut link = self.link.lock().await;
        if link.connection.as_ref().is_some_and(|c| Arc::ptr_eq(c, connection)) {
            link.connection = None;
        }
    }

    async fn call_with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        call: F,
    ) -> Result<T, ClientError>
    where
        F: Fn(Arc<Connection>) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let call = &call;
        let result = self
            .config
            .retry
            .run(operation, move |_| async move {
                let connection = self.acquire().await.map_err(AttemptError::Connect)?;
                match call(connection.clone()).await {
                    Ok(value) => Ok(value),
                    Err(e) => {
                        if e.is_retryable() {
                            self.discard(&connection).await;
                        }
                        Err(AttemptError::Transport(e))
                    }
                }
            })
            .await;

        result.map_err(|failure| match failure {
            AttemptError::Connect(e) => e,
            AttemptError::Transport(source) if source.is_retryable() => {
                ClientError::RetriesExhausted {
                    operation,
                    attempts: self.config.retry.max_attempts,
                    source,
                }
            }
            AttemptError::Transport(source) => ClientError::Rejected { operation, source },
        })
    }

    /// Send a command, retrying on transport failure with the same sequence
    /// number.
    pub async fn send_command(&self, command: Command) -> Result<CommandReply, ClientError> {
        let seq = self.next_seq().await;
        let request = CommandRequest::new(self.identity.clone(), seq, command);
        let timeout = self.config.call_timeout;

        debug!("Sending {} seq={}", request.command.name(), seq);
        let reply = self
            .call_with_retry("SendCommand", |connection| {
                let request = request.clone();
                async move { connection.send_command(request, timeout).await }
            })
            .await?;
        debug!("Got reply for seq={}: applied={} message={}", seq, reply.applied, reply.message);

        Ok(reply)
    }

    /// Fetch the global player snapshot.
    pub async fn query_state(&self) -> Result<StateReply, ClientError> {
        let timeout = self.config.call_timeout;

        let reply = self
            .call_with_retry("GetState", |connection| {
                let request = StateRequest {
                    identity: self.identity.clone(),
                    client_time: Utc::now(),
                };
                async move { connection.get_state(request, timeout).await }
            })
            .await?;
        debug!("Received state with {} players", reply.players.len());

        Ok(reply)
    }

    /// Register with the server.
    pub async fn register(
        &self,
        name: &str,
        spawn: Option<(i32, i32)>,
    ) -> Result<CommandReply, ClientError> {
        let payload = match spawn {
            Some((x, y)) => RegisterPayload::at(name, x, y)?,
            None => RegisterPayload::new(name)?,
        };
        self.send_command(Command::Register(payload)).await
    }

    /// Report the local position after a move.
    pub async fn update_position(
        &self,
        x: i32,
        y: i32,
        lives: i32,
    ) -> Result<CommandReply, ClientError> {
        let payload = UpdatePosPayload::new(x, y, lives)?;
        self.send_command(Command::UpdatePos(payload)).await
    }

    /// Leave the game.
    pub async fn logout(&self) -> Result<CommandReply, ClientError> {
        self.send_command(Command::Logout).await
    }
}
