//! Authority State
//!
//! The two maps the authority owns: tracked players and the
//! deduplication cache of processed commands. Nothing in here locks;
//! callers hold the authority's mutex for every method.
//!
//! Uses BTreeMap so snapshots come out ordered by identity.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::network::protocol::{
    Command, CommandReply, CommandRequest, PlayerSnapshot, StateReply,
};

/// Lives a freshly registered player starts with.
pub const STARTING_LIVES: i32 = 3;

// =============================================================================
// RECORDS
// =============================================================================

/// Server-side view of one player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerRecord {
    /// Player identity.
    pub id: String,
    /// Column.
    pub x: i32,
    /// Row.
    pub y: i32,
    /// Remaining lives.
    pub lives: i32,
    /// Time of the last accepted REGISTER or UPDATE_POS.
    pub last_seen: DateTime<Utc>,
}

impl PlayerRecord {
    /// Copy into the wire representation.
    pub fn snapshot(&self) -> PlayerSnapshot {
        PlayerSnapshot {
            id: self.id.clone(),
            x: self.x,
            y: self.y,
            lives: self.lives,
            last_seen_unix: self.last_seen.timestamp(),
        }
    }
}

/// A reply remembered for one `(identity, seq)` pair. Never modified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    /// Reply produced the first time the pair was seen.
    pub reply: CommandReply,
    /// When the reply was stored.
    pub stored_at: DateTime<Utc>,
}

/// Result of executing a command for the first time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Player created or overwritten.
    Registered,
    /// Position and lives overwritten.
    PositionUpdated,
    /// Player removed (or was already absent).
    LoggedOut,
    /// Payload failed validation; nothing changed.
    BadPayload,
    /// Command name not recognized; nothing changed.
    UnknownCommand,
}

impl Outcome {
    /// Whether server state was changed.
    pub fn applied(self) -> bool {
        !matches!(self, Outcome::BadPayload | Outcome::UnknownCommand)
    }

    /// Reply message tag.
    pub fn message(self) -> &'static str {
        match self {
            Outcome::Registered => "registered",
            Outcome::PositionUpdated => "position-updated",
            Outcome::LoggedOut => "logged-out",
            Outcome::BadPayload => "bad-payload",
            Outcome::UnknownCommand => "unknown-command",
        }
    }

    /// Build the reply for a sequence number.
    pub fn reply(self, seq: i64) -> CommandReply {
        CommandReply { seq, applied: self.applied(), message: self.message().to_string() }
    }
}

/// What one eviction pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Inactive players dropped.
    pub players_removed: usize,
    /// Expired dedup records dropped.
    pub commands_removed: usize,
}

impl EvictionReport {
    /// True when nothing was removed.
    pub fn is_empty(&self) -> bool {
        self.players_removed == 0 && self.commands_removed == 0
    }
}

fn older_than(stamp: DateTime<Utc>, now: DateTime<Utc>, ttl: Duration) -> bool {
    // A stamp in the future has a negative age and never expires.
    (now - stamp).to_std().map(|age| age > ttl).unwrap_or(false)
}

// =============================================================================
// STATE
// =============================================================================

/// Players plus processed-command cache.
#[derive(Debug, Default)]
pub struct AuthorityState {
    players: BTreeMap<String, PlayerRecord>,
    processed: BTreeMap<String, BTreeMap<i64, CommandRecord>>,
}

impl AuthorityState {
    /// Create empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a command exactly once.
    ///
    /// A repeated `(identity, seq)` returns the stored reply without
    /// executing anything. Otherwise the command runs and its reply is
    /// cached before returning.
    pub fn apply(&mut self, request: &CommandRequest, now: DateTime<Utc>) -> CommandReply {
        if let Some(record) = self.cached(&request.identity, request.seq) {
            debug!(
                "Duplicate command for {} seq={}, returning cached reply",
                request.identity, request.seq
            );
            return record.reply.clone();
        }

        let reply = self.execute(request, now).reply(request.seq);

        self.processed
            .entry(request.identity.clone())
            .or_default()
            .insert(request.seq, CommandRecord { reply: reply.clone(), stored_at: now });

        reply
    }

    /// Look up a processed command.
    pub fn cached(&self, identity: &str, seq: i64) -> Option<&CommandRecord> {
        self.processed.get(identity)?.get(&seq)
    }

    fn execute(&mut self, request: &CommandRequest, now: DateTime<Utc>) -> Outcome {
        let identity = &request.identity;

        match &request.command {
            Command::Register(payload) => {
                if let Err(e) = payload.validate() {
                    warn!("Rejected REGISTER from {}: {}", identity, e);
                    return Outcome::BadPayload;
                }
                let (x, y) = payload.position();
                let record = PlayerRecord {
                    id: identity.clone(),
                    x,
                    y,
                    lives: STARTING_LIVES,
                    last_seen: now,
                };
                self.players.insert(identity.clone(), record);
                info!("Registered player {} ({}) at ({}, {})", identity, payload.name, x, y);
                Outcome::Registered
            }
            Command::UpdatePos(payload) => {
                if let Err(e) = payload.validate() {
                    warn!("Rejected UPDATE_POS from {}: {}", identity, e);
                    return Outcome::BadPayload;
                }
                let record = PlayerRecord {
                    id: identity.clone(),
                    x: payload.x,
                    y: payload.y,
                    lives: payload.lives,
                    last_seen: now,
                };
                self.players.insert(identity.clone(), record);
                debug!(
                    "Updated position for {} -> ({}, {}) lives={}",
                    identity, payload.x, payload.y, payload.lives
                );
                Outcome::PositionUpdated
            }
            Command::Logout => {
                if self.players.remove(identity).is_some() {
                    info!("Player {} logged out", identity);
                } else {
                    debug!("Logout from untracked player {}", identity);
                }
                Outcome::LoggedOut
            }
            Command::Malformed { name, reason, .. } => {
                warn!("Rejected {} from {}: {}", name, identity, reason);
                Outcome::BadPayload
            }
            Command::Unknown { name } => {
                warn!("Unknown command {} from {}", name, identity);
                Outcome::UnknownCommand
            }
        }
    }

    /// Copy every tracked player.
    pub fn snapshot(&self, now: DateTime<Utc>) -> StateReply {
        StateReply {
            players: self.players.values().map(PlayerRecord::snapshot).collect(),
            server_time_unix: now.timestamp(),
        }
    }

    /// Drop players idle longer than `player_ttl` and dedup records older
    /// than `processed_ttl`.
    pub fn evict(
        &mut self,
        now: DateTime<Utc>,
        player_ttl: Duration,
        processed_ttl: Duration,
    ) -> EvictionReport {
        let mut report = EvictionReport::default();

        self.players.retain(|id, player| {
            let keep = !older_than(player.last_seen, now, player_ttl);
            if !keep {
                info!("Removing inactive player {} (last seen {})", id, player.last_seen);
                report.players_removed += 1;
            }
            keep
        });

        self.processed.retain(|_, commands| {
            let before = commands.len();
            commands.retain(|_, record| !older_than(record.stored_at, now, processed_ttl));
            report.commands_removed += before - commands.len();
            !commands.is_empty()
        });

        report
    }

    /// Tracked player.
    pub fn player(&self, identity: &str) -> Option<&PlayerRecord> {
        self.players.get(identity)
    }

    /// Number of tracked players.
    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Number of cached replies across all identities.
    pub fn processed_count(&self) -> usize {
        self.processed.values().map(BTreeMap::len).sum()
    }
}
