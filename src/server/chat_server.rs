//! TCP chat server
//!
//! This module provides the listener that accepts connections, seeds and
//! loads the room registry, and spawns one [`Session`] per client.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use super::room_manager::RoomRegistry;
use super::session::{Session, SessionConfig};
use crate::error::{ChatError, Result};
use crate::protocol::{DEFAULT_MAX_FRAME_LEN, Reply};
use crate::store::ChatStore;

/// Room created when the store holds none
pub const DEFAULT_ROOM: &str = "general";

/// Default listening port
pub const DEFAULT_PORT: u16 = 1234;

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Rooms to create at startup if missing
    pub rooms: Vec<String>,
    /// Maximum concurrent sessions, unlimited when `None`
    pub max_connections: Option<usize>,
    /// Session idle timeout, disabled when `None`
    pub idle_timeout: Option<Duration>,
    /// Largest accepted inbound frame
    pub max_frame_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            rooms: Vec::new(),
            max_connections: None,
            idle_timeout: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl ServerConfig {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            idle_timeout: self.idle_timeout,
            max_frame_len: self.max_frame_len,
        }
    }
}

/// Line-protocol chat server
pub struct ChatServer {
    /// Server configuration
    config: ServerConfig,
    /// Bound listener
    listener: TcpListener,
    /// All rooms, fixed after startup
    registry: Arc<RoomRegistry>,
    /// Persistence
    store: Arc<dyn ChatStore>,
    /// Sessions currently running
    active: Arc<AtomicUsize>,
    /// Connections accepted since startup
    accepted: AtomicU64,
    /// Connections turned away by the limit
    rejected: AtomicU64,
}

impl ChatServer {
    /// Seed rooms, load the registry and bind the listener
    pub async fn bind(config: ServerConfig, store: Arc<dyn ChatStore>) -> Result<Self> {
        info!("Starting chat server on {}", config.bind_addr);

        seed_rooms(store.as_ref(), &config.rooms)?;
        let registry = Arc::new(RoomRegistry::load(store.as_ref())?);

        let listener = TcpListener::bind(config.bind_addr).await.map_err(|e| {
            ChatError::network(format!("Failed to bind {}: {}", config.bind_addr, e))
        })?;
        info!(
            "Server listening on {} with {} rooms",
            listener.local_addr()?,
            registry.len()
        );

        Ok(Self {
            config,
            listener,
            registry,
            store,
            active: Arc::new(AtomicUsize::new(0)),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Get the room registry
    pub fn registry(&self) -> Arc<RoomRegistry> {
        Arc::clone(&self.registry)
    }

    /// Accept connections until the process ends
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` completes.
    ///
    /// Sessions already running are left to finish on their own.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => self.handle_connection(stream, addr),
                    Err(e) => {
                        error!("Accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        let stats = self.stats();
        info!(
            "Server stopped after {} connections ({} active)",
            stats.accepted_connections, stats.active_sessions
        );
        Ok(())
    }

    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        self.accepted.fetch_add(1, Ordering::Relaxed);

        if let Some(max) = self.config.max_connections {
            if self.active.load(Ordering::Acquire) >= max {
                let err = ChatError::resource_limit(format!("{} connections", max));
                warn!("Rejecting {}: {} (code {})", addr, err, err.code());
                self.rejected.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(reject(stream));
                return;
            }
        }

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }

        let guard = ActiveGuard::new(Arc::clone(&self.active));
        let session = Session::new(
            stream,
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
            self.config.session_config(),
        )
        .with_peer(addr);
        let id = session.id();

        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = session.run().await {
                if e.is_session_fatal() {
                    debug!("Session {} from {} ended: {}", id, addr, e);
                } else {
                    warn!("Session {} from {} failed: {}", id, addr, e);
                }
            }
        });
    }

    /// Get server statistics
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            active_sessions: self.active.load(Ordering::Acquire),
            accepted_connections: self.accepted.load(Ordering::Relaxed),
            rejected_connections: self.rejected.load(Ordering::Relaxed),
            total_rooms: self.registry.len(),
            room_members: self.registry.member_counts(),
            bind_address: self.config.bind_addr,
        }
    }
}

/// Server statistics
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub active_sessions: usize,
    pub accepted_connections: u64,
    pub rejected_connections: u64,
    pub total_rooms: usize,
    /// (room name, member count), sorted by name
    pub room_members: Vec<(String, usize)>,
    pub bind_address: SocketAddr,
}

/// Create configured rooms, falling back to [`DEFAULT_ROOM`] on an empty store
pub fn seed_rooms(store: &dyn ChatStore, rooms: &[String]) -> Result<()> {
    for room in rooms {
        let id = store.ensure_room(room)?;
        debug!("Room {} has id {}", room, id);
    }

    if store.room_names()?.is_empty() {
        info!("No rooms configured, creating {}", DEFAULT_ROOM);
        store.ensure_room(DEFAULT_ROOM)?;
    }
    Ok(())
}

async fn reject(mut stream: TcpStream) {
    let _ = stream.write_all(&Reply::ServerFull.encode(None)).await;
    let _ = stream.shutdown().await;
}

/// Counts a session as active for as long as it lives
struct ActiveGuard {
    active: Arc<AtomicUsize>,
}

impl ActiveGuard {
    fn new(active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::AcqRel);
        Self { active }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}
