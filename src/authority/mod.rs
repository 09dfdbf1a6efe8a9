//! Command Authority
//!
//! Single source of truth for player state. Applies REGISTER / UPDATE_POS /
//! LOGOUT with exactly-once semantics and serves player snapshots.
//!
//! ## Locking
//!
//! Both maps live behind one mutex. A command's mutation and the caching of
//! its reply happen inside the same critical section, so two concurrent
//! retransmissions of one `(identity, seq)` serialize and the second always
//! sees the first one's cached reply. Snapshots and eviction take the same
//! lock and never observe a half-applied command. Nothing inside the lock
//! does I/O.

pub mod eviction;
pub mod state;

pub use eviction::{EvictionHandle, EvictionScheduler};
pub use state::{AuthorityState, CommandRecord, EvictionReport, Outcome, PlayerRecord};

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::instrument;

use crate::network::protocol::{CommandReply, CommandRequest, StateReply};

/// Retention settings. Fixed at startup.
#[derive(Debug, Clone)]
pub struct AuthorityConfig {
    /// Players idle longer than this are evicted.
    pub player_ttl: Duration,
    /// Cached replies older than this are evicted.
    pub processed_ttl: Duration,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            player_ttl: Duration::from_secs(60),
            processed_ttl: Duration::from_secs(30 * 60),
        }
    }
}

/// The authority.
#[derive(Debug)]
pub struct Authority {
    config: AuthorityConfig,
    state: Mutex<AuthorityState>,
}

impl Authority {
    /// Create an authority with empty state.
    pub fn new(config: AuthorityConfig) -> Self {
        Self { config, state: Mutex::new(AuthorityState::new()) }
    }

    /// Retention settings.
    pub fn config(&self) -> &AuthorityConfig {
        &self.config
    }

    /// Apply a command, or return the cached reply for a retransmission.
    #[instrument(skip(self, request), fields(identity = %request.identity, seq = request.seq))]
    pub async fn handle_command(&self, request: &CommandRequest) -> CommandReply {
        self.handle_command_at(request, Utc::now()).await
    }

    /// [`Authority::handle_command`] with an explicit clock reading.
    pub async fn handle_command_at(
        &self,
        request: &CommandRequest,
        now: DateTime<Utc>,
    ) -> CommandReply {
        let mut state = self.state.lock().await;
        state.apply(request, now)
    }

    /// Snapshot of every tracked player.
    pub async fn handle_state_query(&self) -> StateReply {
        self.handle_state_query_at(Utc::now()).await
    }

    /// [`Authority::handle_state_query`] with an explicit clock reading.
    pub async fn handle_state_query_at(&self, now: DateTime<Utc>) -> StateReply {
        let state = self.state.lock().await;
        state.snapshot(now)
    }

    /// Remove inactive players and expired cached replies.
    pub async fn evict_expired(&self) -> EvictionReport {
        self.evict_expired_at(Utc::now()).await
    }

    /// [`Authority::evict_expired`] with an explicit clock reading.
    pub async fn evict_expired_at(&self, now: DateTime<Utc>) -> EvictionReport {
        let mut state = self.state.lock().await;
        state.evict(now, self.config.player_ttl, self.config.processed_ttl)
    }

    /// Number of tracked players.
    pub async fn player_count(&self) -> usize {
        self.state.lock().await.player_count()
    }

    /// Number of cached replies.
    pub async fn processed_count(&self) -> usize {
        self.state.lock().await.processed_count()
    }
}

impl Default for Authority {
    fn default() -> Self {
        Self::new(AuthorityConfig::default())
    }
}
