//! Client Connection
//!
//! One persistent WebSocket to the server with many calls in flight.
//! A writer task drains the outgoing queue; a reader task hands each reply
//! to the caller waiting on its `call_id`. When the socket dies every
//! pending call fails and the connection reports itself closed, so the
//! owner can throw it away and dial again.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::network::protocol::{
    ClientMessage, CommandReply, CommandRequest, ServerMessage, StateReply, StateRequest,
};
use crate::network::retry::Retryable;

type PendingCalls = Arc<Mutex<BTreeMap<u64, oneshot::Sender<ServerMessage>>>>;

/// Transport-level failure.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not open the WebSocket.
    #[error("failed to connect to {addr}: {source}")]
    Dial {
        /// Server address.
        addr: String,
        /// Underlying error.
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    /// The connection went away before the reply arrived.
    #[error("connection closed")]
    Closed,

    /// No reply within the call timeout.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The server answered with something other than the expected reply.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    /// The server refused the call.
    #[error("server rejected call: {0}")]
    Rejected(String),
}

impl Retryable for TransportError {
    fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Rejected(_) | TransportError::UnexpectedReply(_))
    }
}

/// A live, multiplexed connection.
pub struct Connection {
    addr: String,
    next_call_id: AtomicU64,
    outgoing: mpsc::Sender<ClientMessage>,
    pending: PendingCalls,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    /// Open a WebSocket to `addr` (`host:port`).
    pub async fn dial(addr: &str) -> Result<Self, TransportError> {
        let url = format!("ws://{}", addr);
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|source| TransportError::Dial { addr: addr.to_string(), source })?;

        let (mut write, mut read) = ws_stream.split();
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<ClientMessage>(64);
        let pending: PendingCalls = Arc::default();
        let closed = Arc::new(AtomicBool::new(false));

        let writer_closed = closed.clone();
        let writer = tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let text = match msg.to_json() {
                    Ok(t) => t,
                    Err(e) => {
                        error!("Failed to serialize call {}: {}", msg.call_id(), e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text)).await {
                    debug!("WebSocket write failed: {}", e);
                    break;
                }
            }
            writer_closed.store(true, Ordering::SeqCst);
            let _ = write.close().await;
        });

        let reader_pending = pending.clone();
        let reader_closed = closed.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match ServerMessage::from_json(&text) {
                        Ok(ServerMessage::Shutdown { reason }) => {
                            info!("Server closing connection: {}", reason);
                            break;
                        }
                        Ok(msg) => Self::route(&reader_pending, msg),
                        Err(e) => warn!("Failed to parse server message: {} - {}", e, text),
                    },
                    Ok(Message::Close(_)) => {
                        debug!("Server closed connection");
                        break;
                    }
                    Err(e) => {
                        debug!("WebSocket read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            // Flag first, then fail the waiters; `call` checks in the
            // opposite order so no waiter is left behind.
            reader_closed.store(true, Ordering::SeqCst);
            if let Ok(mut pending) = reader_pending.lock() {
                pending.clear();
            }
        });

        Ok(Self {
            addr: addr.to_string(),
            next_call_id: AtomicU64::new(1),
            outgoing: outgoing_tx,
            pending,
            closed,
            reader,
            writer,
        })
    }

    fn route(pending: &PendingCalls, msg: ServerMessage) {
        let Some(call_id) = msg.call_id() else {
            warn!("Server error without call id: {:?}", msg);
            return;
        };

        let waiter = pending.lock().ok().and_then(|mut p| p.remove(&call_id));
        match waiter {
            Some(tx) => {
                let _ = tx.send(msg);
            }
            None => debug!("Reply for call {} arrived after its caller gave up", call_id),
        }
    }

    fn forget(&self, call_id: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&call_id);
        }
    }

    /// Server address this connection was dialed to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// True once either half of the socket has stopped.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.reader.is_finished() || self.writer.is_finished()
    }

    /// Send one message and wait for the reply carrying the same `call_id`.
    pub async fn call(
        &self,
        build: impl FnOnce(u64) -> ClientMessage,
        timeout: Duration,
    ) -> Result<ServerMessage, TransportError> {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(call_id, tx);
        }
        if self.closed.load(Ordering::SeqCst) {
            self.forget(call_id);
            return Err(TransportError::Closed);
        }

        if self.outgoing.send(build(call_id)).await.is_err() {
            self.forget(call_id);
            return Err(TransportError::Closed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.forget(call_id);
                Err(TransportError::Timeout(timeout))
            }
        }
    }

    /// `SendCommand` procedure.
    pub async fn send_command(
        &self,
        request: CommandRequest,
        timeout: Duration,
    ) -> Result<CommandReply, TransportError> {
        let msg = self
            .call(|call_id| ClientMessage::SendCommand { call_id, request }, timeout)
            .await?;

        match msg {
            ServerMessage::CommandReply { reply, .. } => Ok(reply),
            ServerMessage::Error { error, .. } => Err(TransportError::Rejected(error.message)),
            other => Err(TransportError::UnexpectedReply(format!("{:?}", other))),
        }
    }

    /// `GetState` procedure.
    pub async fn get_state(
        &self,
        request: StateRequest,
        timeout: Duration,
    ) -> Result<StateReply, TransportError> {
        let msg = self
            .call(|call_id| ClientMessage::GetState { call_id, request }, timeout)
            .await?;

        match msg {
            ServerMessage::State { reply, .. } => Ok(reply),
            ServerMessage::Error { error, .. } => Err(TransportError::Rejected(error.message)),
            other => Err(TransportError::UnexpectedReply(format!("{:?}", other))),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("closed", &self.is_closed())
            .field("pending_calls", &self.pending.lock().map(|p| p.len()).unwrap_or(0))
            .finish()
    }
}
