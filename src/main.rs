//! Maze Sync Server
//!
//! Authoritative state server for the multiplayer maze game.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use maze_sync::authority::AuthorityConfig;
use maze_sync::network::server::{ServerConfig, SyncServer, DEFAULT_PORT};
use maze_sync::VERSION;

#[derive(Parser)]
#[command(name = "maze-sync-server")]
#[command(about = "Maze game state server")]
struct Args {
    #[arg(short, long, env = "GAME_BIND", default_value = "0.0.0.0")]
    bind: IpAddr,

    #[arg(short, long, env = "GAME_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Seconds before an idle player is dropped
    #[arg(long, env = "GAME_TTL_PLAYER", default_value_t = 60)]
    ttl_player: u64,

    /// Seconds a cached reply is kept
    #[arg(long, env = "GAME_TTL_PROCESSED", default_value_t = 1800)]
    ttl_processed: u64,

    /// Seconds between eviction passes
    #[arg(long, env = "GAME_EVICTION_PERIOD", default_value_t = 60)]
    eviction_period: u64,

    #[arg(short, long, env = "GAME_MAX_CONNECTIONS", default_value_t = 1000)]
    max_connections: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let config = ServerConfig {
        bind_addr: SocketAddr::new(args.bind, args.port),
        max_connections: args.max_connections,
        eviction_period: Duration::from_secs(args.eviction_period.max(1)),
        authority: AuthorityConfig {
            player_ttl: Duration::from_secs(args.ttl_player),
            processed_ttl: Duration::from_secs(args.ttl_processed),
        },
        version: VERSION.to_string(),
    };

    info!("Maze Sync Server v{}", VERSION);

    let server = Arc::new(SyncServer::new(config));
    let listener = server
        .bind()
        .await
        .context("server startup failed")?;

    let signal_server = server.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, shutting down");
                signal_server.shutdown();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    server.serve(listener).await?;

    info!("Server stopped");
    Ok(())
}
