//! State Poller
//!
//! Polls the server for the player snapshot on a fixed interval and
//! publishes the other players (never the local one) on a watch channel
//! the renderer reads from.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::network::client::{CommandDispatcher, MIN_POLL_INTERVAL};
use crate::network::protocol::{PlayerSnapshot, StateReply};

/// Players in `reply` other than `own_identity`.
pub fn remote_players(reply: StateReply, own_identity: &str) -> Vec<PlayerSnapshot> {
    reply.players.into_iter().filter(|p| p.id != own_identity).collect()
}

/// Periodic `GetState` loop.
pub struct StatePoller {
    dispatcher: Arc<CommandDispatcher>,
    period: Duration,
}

impl StatePoller {
    /// Poll at the dispatcher's configured interval.
    pub fn new(dispatcher: Arc<CommandDispatcher>) -> Self {
        let period = dispatcher.config().poll_interval.max(MIN_POLL_INTERVAL);
        Self { dispatcher, period }
    }

    /// Override the polling interval. Never faster than `MIN_POLL_INTERVAL`.
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period.max(MIN_POLL_INTERVAL);
        self
    }

    /// Run until `shutdown_rx` reads `true` or its sender is dropped.
    ///
    /// A failed poll keeps the last published list; the next tick tries
    /// again.
    pub async fn run(
        self,
        remote: watch::Sender<Vec<PlayerSnapshot>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.dispatcher.query_state().await {
                        Ok(reply) => {
                            let players = remote_players(reply, self.dispatcher.identity());
                            debug!("Poll returned {} remote players", players.len());
                            remote.send_replace(players);
                        }
                        Err(e) => warn!("State poll failed: {}", e),
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("State poller stopped");
                        break;
                    }
                }
            }
        }
    }

    /// Spawn on the current runtime.
    pub fn spawn(self) -> PollerHandle {
        let (remote_tx, remote_rx) = watch::channel(Vec::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(remote_tx, shutdown_rx));
        PollerHandle { remote: remote_rx, shutdown_tx, task }
    }
}

/// Handle to a spawned poller.
pub struct PollerHandle {
    remote: watch::Receiver<Vec<PlayerSnapshot>>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Receiver for the latest remote-player list.
    pub fn players(&self) -> watch::Receiver<Vec<PlayerSnapshot>> {
        self.remote.clone()
    }

    /// Stop polling and wait for the loop to exit.
    pub async fn shutdown(self) {
        self.shutdown_tx.send_replace(true);
        let _ = self.task.await;
    }
}
