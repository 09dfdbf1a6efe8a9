//! Eviction Scheduler
//!
//! Periodic background task that drops inactive players and expired
//! dedup records from the authority. Runs independently of request
//! traffic and stops when its shutdown flag is raised or its sender is
//! dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use super::Authority;

/// Default time between eviction passes.
pub const DEFAULT_EVICTION_PERIOD: Duration = Duration::from_secs(60);

/// Timer-driven eviction loop.
pub struct EvictionScheduler {
    authority: Arc<Authority>,
    period: Duration,
}

impl EvictionScheduler {
    /// Create a scheduler. The first pass runs one `period` after start.
    pub fn new(authority: Arc<Authority>, period: Duration) -> Self {
        Self { authority, period }
    }

    /// Run until `shutdown_rx` reads `true` or its sender is dropped.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        if *shutdown_rx.borrow() {
            return;
        }

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        info!(
            "Eviction scheduler started (period={:?}, ttl_player={:?}, ttl_processed={:?})",
            self.period,
            self.authority.config().player_ttl,
            self.authority.config().processed_ttl,
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.authority.evict_expired().await;
                    if report.is_empty() {
                        debug!("Eviction pass removed nothing");
                    } else {
                        info!(
                            "Eviction pass removed {} players, {} cached replies",
                            report.players_removed, report.commands_removed
                        );
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Eviction scheduler stopped");
                        break;
                    }
                }
            }
        }
    }

    /// Spawn on the current runtime with its own stop channel.
    ///
    /// Dropping the returned handle also stops the task.
    pub fn spawn(self) -> EvictionHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        EvictionHandle { shutdown_tx, task }
    }
}

/// Handle to a spawned scheduler.
pub struct EvictionHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl EvictionHandle {
    /// Stop the scheduler and wait for the loop to exit.
    pub async fn shutdown(self) {
        self.shutdown_tx.send_replace(true);
        let _ = self.task.await;
    }

    /// True once the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
