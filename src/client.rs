//! TCP chat client implementation
//!
//! This module provides a client for connecting to the chat server, issuing
//! commands and receiving room broadcasts.
//!
//! Every request is tagged with a fresh transaction id so replies can be
//! matched to callers even while broadcasts arrive in between. The server
//! answers unknown commands with a bare error line that carries no id; such a
//! reply resolves the oldest outstanding request.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use crate::error::{ChatError, Result};
use crate::protocol::{Command, DEFAULT_MAX_FRAME_LEN, FrameCodec, InboundFrame, Request};
use crate::server::DEFAULT_PORT;

/// Chat client configuration
#[derive(Clone, Debug)]
pub struct ChatClientConfig {
    /// Server address to connect to
    pub server_addr: SocketAddr,
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
    /// How long to wait for a reply in seconds
    pub request_timeout_secs: u64,
    /// Maximum inbound frame size in bytes
    pub max_frame_len: usize,
}

impl Default for ChatClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            connect_timeout_secs: 10,
            request_timeout_secs: 10,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Events that the client can receive outside of request/reply pairs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A broadcast line from the current room
    Broadcast(String),
    /// Disconnected from server
    Disconnected(String),
}

struct Pending {
    txn_id: String,
    reply: oneshot::Sender<String>,
}

type PendingQueue = Arc<Mutex<VecDeque<Pending>>>;

/// Line-protocol chat client
pub struct ChatClient {
    config: ChatClientConfig,
    /// Requests are written one at a time
    writer: AsyncMutex<OwnedWriteHalf>,
    /// Outstanding requests in send order
    pending: PendingQueue,
    next_txn: AtomicU64,
    reader_task: JoinHandle<()>,
}

impl ChatClient {
    /// Connect to the chat server.
    ///
    /// Returns the client and the receiver for broadcasts and disconnect
    /// notifications.
    pub async fn connect(
        config: ChatClientConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>)> {
        info!("Connecting to chat server at {}", config.server_addr);

        let stream = tokio::time::timeout(
            Duration::from_secs(config.connect_timeout_secs),
            TcpStream::connect(config.server_addr),
        )
        .await
        .map_err(|_| ChatError::timeout("Connection timeout"))?
        .map_err(|e| ChatError::network(format!("Failed to connect: {}", e)))?;
        stream.set_nodelay(true)?;

        info!("Successfully connected to server");

        let (read_half, write_half) = stream.into_split();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let pending: PendingQueue = Arc::new(Mutex::new(VecDeque::new()));

        let reader_task = tokio::spawn(receive_loop(
            FramedRead::new(read_half, FrameCodec::with_max_len(config.max_frame_len)),
            Arc::clone(&pending),
            event_tx,
        ));

        let client = Self {
            config,
            writer: AsyncMutex::new(write_half),
            pending,
            next_txn: AtomicU64::new(1),
            reader_task,
        };
        Ok((client, event_rx))
    }

    /// Send a command and wait for its reply body
    pub async fn request(&self, command: Command) -> Result<String> {
        let txn_id = self.next_txn.fetch_add(1, Ordering::Relaxed).to_string();
        let frame = Request::with_txn(txn_id.clone(), command)
            .encode()
            .map_err(|e| ChatError::protocol(e.to_string()))?;
        let (tx, rx) = oneshot::channel();

        {
            // Register and write under the same lock so the pending queue
            // matches wire order
            let mut writer = self.writer.lock().await;
            self.pending.lock().push_back(Pending {
                txn_id: txn_id.clone(),
                reply: tx,
            });
            if let Err(e) = writer.write_all(&frame).await {
                self.forget(&txn_id);
                return Err(ChatError::network(format!("Failed to send request: {}", e)));
            }
        }

        match tokio::time::timeout(Duration::from_secs(self.config.request_timeout_secs), rx).await
        {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(_)) => Err(ChatError::network("Connection closed before reply")),
            Err(_) => {
                self.forget(&txn_id);
                Err(ChatError::timeout(format!("No reply to request {}", txn_id)))
            }
        }
    }

    fn forget(&self, txn_id: &str) {
        self.pending.lock().retain(|p| p.txn_id != txn_id);
    }

    /// Log in as an existing user
    pub async fn login(&self, username: &str, password: &str) -> Result<bool> {
        let reply = self
            .request(Command::Login {
                username: username.to_string(),
                password: password.to_string(),
            })
            .await?;
        Ok(reply == "TRUE")
    }

    /// Register a new user and log in as it
    pub async fn register(&self, username: &str, password: &str) -> Result<bool> {
        let reply = self
            .request(Command::Register {
                username: username.to_string(),
                password: password.to_string(),
            })
            .await?;
        Ok(reply == "TRUE")
    }

    /// Select the current room. Returns `false` for an unknown room.
    pub async fn join(&self, room: &str) -> Result<bool> {
        let reply = self
            .request(Command::Menu {
                room: room.to_string(),
            })
            .await?;
        Ok(reply != "FALSE" && !reply.starts_with("ERROR"))
    }

    /// Post a message to the current room
    pub async fn send_message(&self, text: &str) -> Result<()> {
        let reply = self
            .request(Command::Msg {
                text: text.to_string(),
            })
            .await?;
        expect_true(reply)
    }

    /// Fetch up to `limit` recent messages of the current room, oldest first
    pub async fn logs(&self, limit: usize) -> Result<Vec<String>> {
        let reply = self.request(Command::Logs { limit }).await?;
        if reply.starts_with("ERROR") {
            return Err(ChatError::protocol(reply));
        }
        Ok(split_lines(&reply))
    }

    /// List rooms known to the server
    pub async fn rooms(&self) -> Result<Vec<String>> {
        let reply = self.request(Command::Rooms).await?;
        Ok(split_lines(&reply))
    }

    /// Close the connection
    pub async fn close(self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        drop(writer);
        self.reader_task.abort();
        debug!("Client connection closed");
        Ok(())
    }
}

fn expect_true(reply: String) -> Result<()> {
    match reply.as_str() {
        "TRUE" => Ok(()),
        "FALSE" => Err(ChatError::auth("Request rejected")),
        _ => Err(ChatError::protocol(reply)),
    }
}

fn split_lines(body: &str) -> Vec<String> {
    if body.is_empty() {
        Vec::new()
    } else {
        body.split('\n').map(str::to_string).collect()
    }
}

/// Route inbound frames to waiting requests or to the event channel
async fn receive_loop(
    mut frames: FramedRead<OwnedReadHalf, FrameCodec>,
    pending: PendingQueue,
    events: mpsc::UnboundedSender<ClientEvent>,
) {
    let reason = loop {
        match frames.next().await {
            Some(Ok(InboundFrame::Frame(frame))) => match frame.text() {
                Ok(text) => route(text, &pending, &events),
                Err(e) => warn!("Dropping non UTF-8 frame: {}", e),
            },
            Some(Ok(other)) => warn!("Dropping malformed frame: {:?}", other),
            Some(Err(e)) => break format!("Connection lost: {}", e),
            None => break "Server closed the connection".to_string(),
        }
    };

    debug!("Receiver stopped: {}", reason);
    // Fail anything still waiting
    pending.lock().clear();
    let _ = events.send(ClientEvent::Disconnected(reason));
}

fn route(text: &str, pending: &PendingQueue, events: &mpsc::UnboundedSender<ClientEvent>) {
    let mut queue = pending.lock();

    if let Some((first, body)) = text.split_once('\n') {
        if let Some(pos) = queue.iter().position(|p| p.txn_id == first) {
            if let Some(waiter) = queue.remove(pos) {
                let _ = waiter.reply.send(body.to_string());
            }
            return;
        }
    }

    if text.starts_with("ERROR") {
        if let Some(waiter) = queue.pop_front() {
            let _ = waiter.reply.send(text.to_string());
            return;
        }
    }
    drop(queue);

    let _ = events.send(ClientEvent::Broadcast(text.to_string()));
}
