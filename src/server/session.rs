//! Per-connection session handling
//!
//! A session owns one client stream. The read half is driven by the session
//! task, which decodes frames, dispatches commands and updates the session
//! state. The write half belongs to a dedicated writer task fed through the
//! session's [`Outbox`], so replies and broadcasts from other sessions share
//! one ordered queue.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{Instant, timeout};
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};

use super::outbox::{Outbox, SessionId};
use super::room_manager::{Room, RoomRegistry};
use crate::error::{ChatError, Result};
use crate::protocol::{
    Command, DEFAULT_MAX_FRAME_LEN, FrameCodec, InboundFrame, ProtocolError, ProtocolErrorKind,
    Reply, Request, broadcast_frame,
};
use crate::store::{ChatStore, StoreError};

/// How long the writer may keep flushing after the read side has finished
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Session tunables
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Close the session after this long without a complete inbound frame
    pub idle_timeout: Option<Duration>,
    /// Largest accepted inbound frame
    pub max_frame_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No successful LOGIN or REGISTER yet
    Unauthenticated,
    /// Logged in, no room selected
    Authenticated,
    /// Logged in with a current room
    InRoom,
}

/// One client connection
pub struct Session<S> {
    id: SessionId,
    peer: Option<SocketAddr>,
    stream: S,
    registry: Arc<RoomRegistry>,
    store: Arc<dyn ChatStore>,
    config: SessionConfig,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Create a session over an accepted stream
    pub fn new(
        stream: S,
        registry: Arc<RoomRegistry>,
        store: Arc<dyn ChatStore>,
        config: SessionConfig,
    ) -> Self {
        Self {
            id: SessionId::new(),
            peer: None,
            stream,
            registry,
            store,
            config,
        }
    }

    /// Record the remote address for logging
    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Run the session until the peer disconnects or an I/O error occurs.
    ///
    /// Whatever ends the session, it leaves its current room before this
    /// returns and the writer gets a bounded chance to flush queued frames.
    pub async fn run(self) -> Result<()> {
        let Session {
            id,
            peer,
            stream,
            registry,
            store,
            config,
        } = self;

        match peer {
            Some(addr) => info!("Session {} started for {}", id, addr),
            None => info!("Session {} started", id),
        }

        let (reader, writer) = tokio::io::split(stream);
        let (outbox, queue) = Outbox::channel(id);
        let mut writer_task = tokio::spawn(queue.drain(writer));

        let mut frames = FramedRead::new(reader, FrameCodec::with_max_len(config.max_frame_len));
        let mut state = SessionState::new(id, outbox, registry, store);

        let mut writer_done = false;
        let result = tokio::select! {
            read = read_loop(&mut frames, &mut state, config.idle_timeout) => read,
            written = &mut writer_task => {
                writer_done = true;
                written.map_err(ChatError::from).and_then(|r| r)
            }
        };

        // Leave the room and close the outbox so the writer drains and stops
        state.leave_current_room();
        drop(state);

        if !writer_done {
            match timeout(FLUSH_TIMEOUT, &mut writer_task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => debug!("Session {} writer stopped: {}", id, e),
                Ok(Err(e)) => warn!("Session {} writer task failed: {}", id, e),
                Err(_) => {
                    warn!("Session {} writer did not flush in time", id);
                    writer_task.abort();
                }
            }
        }

        match &result {
            Ok(()) => info!("Session {} closed", id),
            Err(e) => info!("Session {} closed: {} (code {})", id, e, e.code()),
        }
        result
    }
}

/// Read frames and dispatch them until the stream ends
async fn read_loop<R>(
    frames: &mut FramedRead<R, FrameCodec>,
    state: &mut SessionState,
    idle_timeout: Option<Duration>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let next = match idle_timeout {
            Some(limit) => match timeout(limit, frames.next()).await {
                Ok(next) => next,
                Err(_) => {
                    return Err(ChatError::timeout(format!(
                        "no complete frame for {:?}",
                        limit
                    )));
                }
            },
            None => frames.next().await,
        };

        match next {
            Some(Ok(inbound)) => {
                let truncated = matches!(inbound, InboundFrame::Truncated(_));
                state.handle_inbound(inbound);
                if truncated {
                    return Ok(());
                }
            }
            Some(Err(e)) => {
                return Err(ChatError::network(format!("Read failed: {}", e)));
            }
            None => {
                debug!("Session {} reached end of stream", state.id);
                return Ok(());
            }
        }
    }
}

/// State owned by the session task
struct SessionState {
    id: SessionId,
    outbox: Outbox,
    username: Option<String>,
    current_room: Option<Arc<Room>>,
    registry: Arc<RoomRegistry>,
    store: Arc<dyn ChatStore>,
    created_at: Instant,
    requests: u64,
}

impl SessionState {
    fn new(
        id: SessionId,
        outbox: Outbox,
        registry: Arc<RoomRegistry>,
        store: Arc<dyn ChatStore>,
    ) -> Self {
        Self {
            id,
            outbox,
            username: None,
            current_room: None,
            registry,
            store,
            created_at: Instant::now(),
            requests: 0,
        }
    }

    fn phase(&self) -> SessionPhase {
        match (&self.username, &self.current_room) {
            (None, _) => SessionPhase::Unauthenticated,
            (Some(_), None) => SessionPhase::Authenticated,
            (Some(_), Some(_)) => SessionPhase::InRoom,
        }
    }

    /// Turn one inbound unit into exactly one reply
    fn handle_inbound(&mut self, inbound: InboundFrame) {
        let parsed = match inbound {
            InboundFrame::Frame(frame) => Request::parse(&frame),
            InboundFrame::Oversized { discarded } => Err(ProtocolError::new(
                ProtocolErrorKind::FrameTooLong,
                format!("{} bytes discarded", discarded),
            )),
            InboundFrame::Truncated(rest) => Err(ProtocolError::new(
                ProtocolErrorKind::Truncated,
                format!("{} bytes without delimiter", rest.len()),
            )),
        };

        let (txn_id, reply) = match parsed {
            Ok(request) => {
                self.requests += 1;
                debug!(
                    "Session {} ({:?}) <- {}",
                    self.id,
                    self.phase(),
                    request.command.keyword()
                );
                let reply = self.dispatch(request.command);
                (request.txn_id, reply)
            }
            Err(e) => {
                warn!("Session {} sent a bad request: {}", self.id, e);
                let reply = e.reply();
                (e.txn_id, reply)
            }
        };

        if !self.outbox.deliver(reply.encode(txn_id.as_deref())) {
            debug!("Session {} outbox closed, reply dropped", self.id);
        }
    }

    fn dispatch(&mut self, command: Command) -> Reply {
        match command {
            Command::Login { username, password } => self.login(username, &password),
            Command::Register { username, password } => self.register(username, &password),
            Command::Menu { room } => self.select_room(&room),
            Command::Msg { text } => self.post_message(&text),
            Command::Logs { limit } => self.history(limit),
            Command::Rooms => Reply::Rooms(self.registry.names()),
        }
    }

    fn login(&mut self, username: String, password: &str) -> Reply {
        match self.store.verify_login(&username, password) {
            Ok(true) => {
                info!("Session {} logged in as {}", self.id, username);
                self.username = Some(username);
                Reply::True
            }
            Ok(false) => {
                info!("Session {} failed login for {}", self.id, username);
                Reply::False
            }
            Err(e) => {
                error!("Login lookup for {} failed: {}", username, e);
                Reply::False
            }
        }
    }

    fn register(&mut self, username: String, password: &str) -> Reply {
        if password.is_empty() {
            return Reply::False;
        }

        match self.store.is_unique(&username) {
            Ok(true) => {}
            Ok(false) => return Reply::False,
            Err(e) => {
                error!("Uniqueness check for {} failed: {}", username, e);
                return Reply::False;
            }
        }

        match self.store.create_user(&username, password) {
            Ok(user_id) => {
                info!(
                    "Session {} registered {} (user {})",
                    self.id, username, user_id
                );
                self.username = Some(username);
                Reply::True
            }
            Err(StoreError::DuplicateUser(_)) => Reply::False,
            Err(e) => {
                warn!("Registration of {} failed: {}", username, e);
                Reply::False
            }
        }
    }

    fn select_room(&mut self, name: &str) -> Reply {
        let Some(room) = self.registry.get(name) else {
            return Reply::False;
        };

        self.switch_room(room);

        match self.store.room_id(name) {
            Ok(Some(id)) => Reply::RoomId(id),
            Ok(None) => Reply::True,
            Err(e) => {
                warn!("Room id lookup for {} failed: {}", name, e);
                Reply::True
            }
        }
    }

    /// Leave the previous room (if different) and join `room`
    fn switch_room(&mut self, room: Arc<Room>) {
        if let Some(previous) = &self.current_room {
            if Arc::ptr_eq(previous, &room) {
                return;
            }
            previous.leave(self.id);
            debug!("Session {} left room {}", self.id, previous.name());
        }

        room.join(self.outbox.member());
        info!("Session {} joined room {}", self.id, room.name());
        self.current_room = Some(room);
    }

    fn post_message(&self, text: &str) -> Reply {
        let Some(username) = self.username.as_deref() else {
            return Reply::Error;
        };
        let Some(room) = self.current_room.as_ref() else {
            return Reply::Error;
        };

        if let Err(e) = self.store.insert_message(room.name(), username, text) {
            error!("Storing message in {} failed: {}", room.name(), e);
            return Reply::Error;
        }

        let delivered = room.broadcast(broadcast_frame(username, text), self.id);
        debug!(
            "Session {} broadcast to {} members of {}",
            self.id,
            delivered,
            room.name()
        );
        Reply::True
    }

    fn history(&self, limit: usize) -> Reply {
        let Some(room) = self.current_room.as_ref() else {
            return Reply::Error;
        };

        match self.store.recent_messages(room.name(), limit) {
            Ok(history) => Reply::History(history),
            Err(e) => {
                error!("Loading history of {} failed: {}", room.name(), e);
                Reply::Error
            }
        }
    }

    fn leave_current_room(&mut self) {
        if let Some(room) = self.current_room.take() {
            room.leave(self.id);
            debug!("Session {} left room {}", self.id, room.name());
        }
    }
}

impl Drop for SessionState {
    fn drop(&mut self) {
        // Covers cancellation of the session task as well as normal exit
        self.leave_current_room();
        debug!(
            "Session {} handled {} requests in {:?}",
            self.id,
            self.requests,
            self.created_at.elapsed()
        );
    }
}
