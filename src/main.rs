//! Roomcast chat server
//!
//! Usage:
//!   roomcast                                   # listen on 0.0.0.0:1234, chat.db
//!   roomcast --port 5000 --room general --room random
//!   RUST_LOG=roomcast=debug roomcast --database :memory:

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use roomcast::protocol::DEFAULT_MAX_FRAME_LEN;
use roomcast::server::{ChatServer, DEFAULT_PORT, ServerConfig};
use roomcast::store::{ChatStore, SqliteStore};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Multi-room chat server speaking a line-oriented TCP protocol
#[derive(Debug, Parser)]
#[command(name = "roomcast", version, about)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "ROOMCAST_BIND", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind: IpAddr,

    /// Port to listen on
    #[arg(short, long, env = "ROOMCAST_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// SQLite database file, or ":memory:" for a throwaway database
    #[arg(long, env = "ROOMCAST_DATABASE", default_value = "chat.db")]
    database: PathBuf,

    /// Room to create at startup if missing (repeatable)
    #[arg(long = "room", env = "ROOMCAST_ROOMS", value_delimiter = ',')]
    rooms: Vec<String>,

    /// Maximum concurrent sessions
    #[arg(long, env = "ROOMCAST_MAX_CONNECTIONS")]
    max_connections: Option<usize>,

    /// Close sessions idle for this many seconds
    #[arg(long, env = "ROOMCAST_IDLE_TIMEOUT_SECS")]
    idle_timeout_secs: Option<u64>,

    /// Largest accepted request frame in bytes
    #[arg(long, env = "ROOMCAST_MAX_FRAME_LEN", default_value_t = DEFAULT_MAX_FRAME_LEN)]
    max_frame_len: usize,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: SocketAddr::new(self.bind, self.port),
            rooms: self.rooms.clone(),
            max_connections: self.max_connections,
            idle_timeout: self.idle_timeout_secs.map(Duration::from_secs),
            max_frame_len: self.max_frame_len,
        }
    }
}

fn open_store(path: &Path) -> anyhow::Result<Arc<dyn ChatStore>> {
    let store = if path == Path::new(":memory:") {
        info!("Using in-memory database");
        SqliteStore::open_in_memory()?
    } else {
        SqliteStore::open(path)?
    };
    Ok(Arc::new(store))
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl-C"),
        Err(e) => {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("roomcast=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.server_config();

    info!("Configuration:");
    info!("  - Bind address: {}", config.bind_addr);
    info!("  - Database: {}", cli.database.display());
    match config.max_connections {
        Some(max) => info!("  - Max connections: {}", max),
        None => info!("  - Max connections: unlimited"),
    }
    match config.idle_timeout {
        Some(idle) => info!("  - Idle timeout: {:?}", idle),
        None => info!("  - Idle timeout: disabled"),
    }
    info!("  - Max frame length: {} bytes", config.max_frame_len);

    let store = open_store(&cli.database)
        .with_context(|| format!("failed to open database {}", cli.database.display()))?;
    let server = ChatServer::bind(config, store)
        .await
        .context("failed to start server")?;

    server.run_until(shutdown_signal()).await?;
    Ok(())
}
