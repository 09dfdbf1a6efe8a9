//! WebSocket RPC Server
//!
//! Async WebSocket server exposing the two procedures, `SendCommand` and
//! `GetState`, on top of the command authority. Every connection gets its
//! own task and every incoming call is handled on a task of its own, so a
//! slow call never blocks the rest of the connection.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::authority::eviction::DEFAULT_EVICTION_PERIOD;
use crate::authority::{Authority, AuthorityConfig, EvictionScheduler};
use crate::network::protocol::{ClientMessage, ErrorCode, ServerError, ServerMessage};

/// Default listening port.
pub const DEFAULT_PORT: u16 = 12345;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Time between eviction passes.
    pub eviction_period: Duration,
    /// Retention settings for the authority.
    pub authority: AuthorityConfig,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_connections: 1000,
            eviction_period: DEFAULT_EVICTION_PERIOD,
            authority: AuthorityConfig::default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Sync server errors.
#[derive(Debug, thiserror::Error)]
pub enum SyncServerError {
    /// Failed to bind to address.
    #[error("Failed to bind {addr}: {source}")]
    BindFailed {
        /// Address we tried to bind.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Listener I/O error.
    #[error("Listener error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connected client state.
struct ConnectedClient {
    /// Identity from the most recent command, once one arrived.
    identity: Option<String>,
    /// Connection time.
    connected_at: Instant,
    /// Last frame received.
    last_activity: Instant,
}

type Clients = Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>;

/// The sync server.
pub struct SyncServer {
    /// Server configuration.
    config: ServerConfig,
    /// Command authority.
    authority: Arc<Authority>,
    /// Connected clients.
    clients: Clients,
    /// One permit per allowed connection.
    connection_slots: Arc<Semaphore>,
    /// Shutdown flag.
    shutdown_tx: watch::Sender<bool>,
}

impl SyncServer {
    /// Create a new server.
    pub fn new(config: ServerConfig) -> Self {
        let authority = Arc::new(Authority::new(config.authority.clone()));
        Self::with_authority(config, authority)
    }

    /// Create a server in front of an existing authority.
    ///
    /// `config.authority` is ignored; the authority keeps its own settings.
    pub fn with_authority(config: ServerConfig, authority: Arc<Authority>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let connection_slots = Arc::new(Semaphore::new(config.max_connections));

        Self {
            config,
            authority,
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            connection_slots,
            shutdown_tx,
        }
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Shared authority.
    pub fn authority(&self) -> Arc<Authority> {
        self.authority.clone()
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, SyncServerError> {
        let addr = self.config.bind_addr;
        TcpListener::bind(addr)
            .await
            .map_err(|source| SyncServerError::BindFailed { addr, source })
    }

    /// Bind and serve until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), SyncServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), SyncServerError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        info!(
            "Sync server v{} listening on {} (ttl_processed={:?}, ttl_player={:?})",
            self.config.version,
            listener.local_addr()?,
            self.authority.config().processed_ttl,
            self.authority.config().player_ttl,
        );

        let eviction_handle = tokio::spawn(
            EvictionScheduler::new(self.authority.clone(), self.config.eviction_period)
                .run(self.shutdown_tx.subscribe()),
        );

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let slot = self.connection_slots.clone().try_acquire_owned();
                            let Ok(slot) = slot else {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            };

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr, slot);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        let _ = eviction_handle.await;

        Ok(())
    }

    /// Handle a new WebSocket connection. The slot is released when the
    /// connection task ends.
    fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        slot: OwnedSemaphorePermit,
    ) {
        let clients = self.clients.clone();
        let authority = self.authority.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            if *shutdown_rx.borrow() {
                return;
            }

            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(64);

            // Register client
            {
                let mut clients = clients.write().await;
                clients.insert(addr, ConnectedClient {
                    identity: None,
                    connected_at: Instant::now(),
                    last_activity: Instant::now(),
                });
            }

            // Spawn message sender task
            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                let _ = ws_sender.close().await;
            });

            // Handle incoming messages
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                {
                                    let mut clients = clients.write().await;
                                    if let Some(client) = clients.get_mut(&addr) {
                                        client.last_activity = Instant::now();
                                    }
                                }

                                match ClientMessage::from_json(&text) {
                                    Ok(client_msg) => Self::spawn_call(
                                        addr,
                                        client_msg,
                                        authority.clone(),
                                        clients.clone(),
                                        msg_tx.clone(),
                                    ),
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", addr, e);
                                        let _ = msg_tx.send(ServerMessage::Error {
                                            call_id: ClientMessage::recover_call_id(&text),
                                            error: ServerError {
                                                code: ErrorCode::InvalidInput,
                                                message: format!("Invalid message format: {}", e),
                                            },
                                        }).await;
                                    }
                                }
                            }
                            Some(Ok(Message::Binary(_))) => {
                                let _ = msg_tx.send(ServerMessage::Error {
                                    call_id: None,
                                    error: ServerError {
                                        code: ErrorCode::InvalidInput,
                                        message: "Binary frames are not supported".to_string(),
                                    },
                                }).await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                warn!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        let _ = msg_tx.send(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            // Let queued replies drain; in-flight calls hold their own senders.
            drop(msg_tx);
            if tokio::time::timeout(Duration::from_secs(1), sender_task).await.is_err() {
                debug!("Sender for {} still busy, detaching", addr);
            }

            // Remove client
            let removed = clients.write().await.remove(&addr);
            drop(slot);
            if let Some(client) = removed {
                info!(
                    "Client {} ({}) cleaned up after {:?}, idle {:?}",
                    addr,
                    client.identity.as_deref().unwrap_or("anonymous"),
                    client.connected_at.elapsed(),
                    client.last_activity.elapsed(),
                );
            }
        });
    }

    /// Serve one call on its own task.
    fn spawn_call(
        addr: SocketAddr,
        msg: ClientMessage,
        authority: Arc<Authority>,
        clients: Clients,
        sender: mpsc::Sender<ServerMessage>,
    ) {
        tokio::spawn(async move {
            let reply = match msg {
                ClientMessage::SendCommand { call_id, request } => {
                    if let Some(client) = clients.write().await.get_mut(&addr) {
                        client.identity = Some(request.identity.clone());
                    }

                    let reply = authority.handle_command(&request).await;
                    ServerMessage::CommandReply { call_id, reply }
                }
                ClientMessage::GetState { call_id, request } => {
                    debug!(
                        "GetState from {} (client time {})",
                        request.identity, request.client_time
                    );
                    let reply = authority.handle_state_query().await;
                    ServerMessage::State { call_id, reply }
                }
            };

            if sender.send(reply).await.is_err() {
                debug!("Client {} went away before its reply was sent", addr);
            }
        });
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }
}
