//! Maze Sync Client
//!
//! Headless stand-in for the game loop. `play` registers, walks a small
//! loop and prints the other players; `send` fires one raw command with an
//! explicit sequence number; `state` dumps the current snapshot.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use maze_sync::identity::{load_or_create_identity, DEFAULT_IDENTITY_FILE};
use maze_sync::network::client::{ClientConfig, CommandDispatcher, DEFAULT_SERVER_ADDR};
use maze_sync::network::connection::Connection;
use maze_sync::network::poller::StatePoller;
use maze_sync::network::protocol::{
    Command, CommandRequest, RegisterPayload, UpdatePosPayload, LOGOUT, REGISTER, UPDATE_POS,
};

#[derive(Parser)]
#[command(name = "maze-sync-client")]
#[command(about = "Maze game sync client")]
struct Args {
    #[arg(short, long, env = "SERVER_ADDR", default_value = DEFAULT_SERVER_ADDR)]
    server: String,

    #[arg(long, env = "CLIENT_ID", help = "Use this identity instead of the identity file")]
    client_id: Option<String>,

    #[arg(long, env = "CLIENT_ID_FILE", default_value = DEFAULT_IDENTITY_FILE)]
    id_file: String,

    /// State poll interval in ms (min 50)
    #[arg(long, env = "POLL_MS", default_value_t = 300)]
    poll_ms: u64,

    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Register, walk around and report the other players until Ctrl-C
    Play {
        #[arg(long, default_value = "player")]
        name: String,

        #[arg(long, default_value_t = 500, help = "Milliseconds between moves")]
        step_ms: u64,

        #[arg(long, help = "Stop after this many moves")]
        steps: Option<u64>,
    },

    /// Send one command with an explicit sequence number
    Send {
        #[arg(long)]
        seq: i64,

        #[arg(help = "REGISTER, UPDATE_POS, LOGOUT or any other name")]
        command: String,

        #[arg(long, default_value = "player")]
        name: String,

        #[arg(long)]
        x: Option<i32>,

        #[arg(long)]
        y: Option<i32>,

        #[arg(long, default_value_t = 3)]
        lives: i32,

        #[arg(long, default_value_t = 1, help = "Send the same request this many times")]
        repeat: u32,
    },

    /// Print the current player snapshot
    State,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let identity = match args.client_id.filter(|id| !id.trim().is_empty()) {
        Some(id) => id.trim().to_string(),
        None => load_or_create_identity(&args.id_file)?,
    };
    info!("Client identity {}", identity);

    let config = ClientConfig {
        server_addr: args.server,
        ..Default::default()
    }
    .with_poll_millis(args.poll_ms);

    match args.command {
        Mode::Play { name, step_ms, steps } => {
            play(identity, config, &name, Duration::from_millis(step_ms.max(1)), steps).await
        }
        Mode::Send { seq, command, name, x, y, lives, repeat } => {
            let command = raw_command(&command, name, x, y, lives);
            send(identity, config, seq, command, repeat).await
        }
        Mode::State => state(identity, config).await,
    }
}

/// Build a command without local validation, so the server's handling of
/// bad payloads can be observed.
fn raw_command(name: &str, player: String, x: Option<i32>, y: Option<i32>, lives: i32) -> Command {
    match name {
        REGISTER => Command::Register(RegisterPayload { name: player, x, y }),
        UPDATE_POS => Command::UpdatePos(UpdatePosPayload {
            x: x.unwrap_or(0),
            y: y.unwrap_or(0),
            lives,
        }),
        LOGOUT => Command::Logout,
        other => Command::Unknown { name: other.to_string() },
    }
}

/// Corners of the square the headless player walks around.
const WALK: [(i32, i32); 4] = [(1, 1), (5, 1), (5, 5), (1, 5)];

async fn play(
    identity: String,
    config: ClientConfig,
    name: &str,
    step: Duration,
    steps: Option<u64>,
) -> Result<()> {
    let dispatcher = Arc::new(CommandDispatcher::resuming(identity, config));

    let (start_x, start_y) = WALK[0];
    let reply = dispatcher
        .register(name, Some((start_x, start_y)))
        .await
        .context("register failed")?;
    info!("Register: applied={} message={}", reply.applied, reply.message);

    let poller = StatePoller::new(dispatcher.clone()).spawn();
    let mut players = poller.players();

    let walk = async {
        let mut moves = 0u64;
        let mut ticker = tokio::time::interval(step);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if steps.is_some_and(|limit| moves >= limit) {
                        break;
                    }
                    let (x, y) = WALK[(moves % WALK.len() as u64) as usize];
                    match dispatcher.update_position(x, y, 3).await {
                        Ok(reply) => info!("Moved to ({}, {}): {}", x, y, reply.message),
                        Err(e) => warn!("Move failed: {}", e),
                    }
                    moves += 1;
                }
                changed = players.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let others = players.borrow_and_update().clone();
                    for p in &others {
                        info!("  {} at ({}, {}) lives={}", p.id, p.x, p.y, p.lives);
                    }
                }
            }
        }
    };

    tokio::select! {
        _ = walk => info!("Walk finished"),
        _ = tokio::signal::ctrl_c() => info!("Ctrl-C received"),
    }

    poller.shutdown().await;

    match dispatcher.logout().await {
        Ok(reply) => info!("Logout: {}", reply.message),
        Err(e) => warn!("Logout failed: {}", e),
    }

    Ok(())
}

async fn send(
    identity: String,
    config: ClientConfig,
    seq: i64,
    command: Command,
    repeat: u32,
) -> Result<()> {
    let connection = Connection::dial(&config.server_addr)
        .await
        .with_context(|| format!("could not connect to {}", config.server_addr))?;

    let request = CommandRequest::new(identity, seq, command);
    for attempt in 1..=repeat.max(1) {
        let reply = connection
            .send_command(request.clone(), config.call_timeout)
            .await
            .with_context(|| format!("{} seq={} failed", request.command.name(), seq))?;
        info!(
            "[{}] seq={} applied={} message={}",
            attempt, reply.seq, reply.applied, reply.message
        );
    }

    Ok(())
}

async fn state(identity: String, config: ClientConfig) -> Result<()> {
    let dispatcher = CommandDispatcher::new(identity, config);
    let reply = dispatcher.query_state().await.context("state query failed")?;

    info!("{} players (server time {})", reply.players.len(), reply.server_time_unix);
    for p in &reply.players {
        info!(
            "  {} at ({}, {}) lives={} last_seen={}",
            p.id, p.x, p.y, p.lives, p.last_seen_unix
        );
    }

    Ok(())
}
