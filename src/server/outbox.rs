//! Per-session outbound queue
//!
//! Every byte a session puts on the wire goes through one FIFO drained by a
//! single writer task, so at most one write is in flight per socket and
//! frames leave in the order they were enqueued. Enqueueing never blocks
//! and never touches the socket.

use std::fmt;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::error::{ChatError, Result};

/// Unique identifier of one client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell sessions apart in logs
        let simple = self.0.simple().to_string();
        f.write_str(&simple[..8])
    }
}

/// Owning handle to a session's outbound queue.
///
/// The queue stays open as long as the `Outbox` lives. Dropping it lets the
/// writer flush what is left and finish.
#[derive(Debug)]
pub struct Outbox {
    session: SessionId,
    tx: mpsc::UnboundedSender<Bytes>,
}

impl Outbox {
    /// Create an outbox and the queue its writer drains
    pub fn channel(session: SessionId) -> (Outbox, OutboundQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Outbox { session, tx }, OutboundQueue { rx })
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }

    /// Enqueue a frame. Returns `false` once the writer is gone.
    pub fn deliver(&self, frame: Bytes) -> bool {
        self.tx.send(frame).is_ok()
    }

    /// Non-owning handle for room membership
    pub fn member(&self) -> MemberHandle {
        MemberHandle {
            session: self.session,
            tx: self.tx.downgrade(),
        }
    }
}

/// Non-owning reference a room keeps to one of its members.
///
/// Holding it does not keep the session's queue alive; delivery to a
/// session that has gone away simply fails.
#[derive(Debug, Clone)]
pub struct MemberHandle {
    session: SessionId,
    tx: mpsc::WeakUnboundedSender<Bytes>,
}

impl MemberHandle {
    pub fn session_id(&self) -> SessionId {
        self.session
    }

    /// Enqueue a frame if the session is still alive
    pub fn deliver(&self, frame: Bytes) -> bool {
        match self.tx.upgrade() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }
}

/// Receiving side of an [`Outbox`]
#[derive(Debug)]
pub struct OutboundQueue {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl OutboundQueue {
    #[cfg(test)]
    pub(crate) fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }

    /// Write queued frames in order until the outbox is dropped.
    ///
    /// Each frame is written completely before the next one starts. The
    /// first write failure ends the drain with a network error.
    pub async fn drain<W>(mut self, mut writer: W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(frame) = self.rx.recv().await {
            trace!("Writing {} byte frame", frame.len());
            writer
                .write_all(&frame)
                .await
                .map_err(|e| ChatError::network(format!("Write failed: {}", e)))?;

            if self.rx.is_empty() {
                writer
                    .flush()
                    .await
                    .map_err(|e| ChatError::network(format!("Flush failed: {}", e)))?;
            }
        }

        // Best effort; the peer may already be gone
        let _ = writer.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_session_id_display_is_short() {
        let id = SessionId::new();
        assert_eq!(id.to_string().len(), 8);
        assert_ne!(id, SessionId::new());
    }

    #[tokio::test]
    async fn test_drain_preserves_enqueue_order() {
        let (outbox, queue) = Outbox::channel(SessionId::new());
        let (client, server) = tokio::io::duplex(64);
        let writer = tokio::spawn(queue.drain(server));

        for i in 0..100 {
            assert!(outbox.deliver(Bytes::from(format!("{}\r\n", i))));
        }
        drop(outbox);

        let mut received = String::new();
        let mut client = client;
        client.read_to_string(&mut received).await.unwrap();
        writer.await.unwrap().unwrap();

        let expected: String = (0..100).map(|i| format!("{}\r\n", i)).collect();
        assert_eq!(received, expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_producers_keep_queue_order() {
        let (outbox, queue) = Outbox::channel(SessionId::new());
        let (mut client, server) = tokio::io::duplex(1024);
        let writer = tokio::spawn(queue.drain(server));

        // The counter lock fixes a global enqueue order across producers
        let counter = Arc::new(parking_lot::Mutex::new(0u32));
        let mut producers = Vec::new();
        for _ in 0..4 {
            let member = outbox.member();
            let counter = counter.clone();
            producers.push(tokio::spawn(async move {
                for _ in 0..50 {
                    {
                        let mut n = counter.lock();
                        *n += 1;
                        assert!(member.deliver(Bytes::from(format!("{}\r\n", *n))));
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }
        drop(outbox);

        let mut received = String::new();
        client.read_to_string(&mut received).await.unwrap();
        writer.await.unwrap().unwrap();

        let numbers: Vec<u32> = received
            .split("\r\n")
            .filter(|s| !s.is_empty())
            .map(|s| s.parse().unwrap())
            .collect();
        assert_eq!(numbers, (1..=200).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_member_handle_does_not_keep_queue_alive() {
        let (outbox, queue) = Outbox::channel(SessionId::new());
        let member = outbox.member();
        assert_eq!(member.session_id(), outbox.session_id());

        drop(queue);
        assert!(!member.deliver(Bytes::from_static(b"x\r\n")));

        drop(outbox);
        assert!(!member.deliver(Bytes::from_static(b"x\r\n")));
    }

    #[tokio::test]
    async fn test_drain_reports_write_failure() {
        let (outbox, queue) = Outbox::channel(SessionId::new());
        let (client, server) = tokio::io::duplex(16);
        drop(client);

        outbox.deliver(Bytes::from_static(b"TRUE\r\n"));
        let err = queue.drain(server).await.unwrap_err();
        assert!(matches!(err, ChatError::Network(_)));
    }
}
