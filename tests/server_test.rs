//! End-to-end tests against a real listener on localhost

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use roomcast::client::{ChatClient, ChatClientConfig, ClientEvent};
use roomcast::server::{ChatServer, RoomRegistry, ServerConfig};
use roomcast::store::{ChatStore, MemoryStore, SqliteStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    registry: Arc<RoomRegistry>,
    store: Arc<dyn ChatStore>,
    server: Arc<ChatServer>,
}

async fn start_server(config: ServerConfig, store: Arc<dyn ChatStore>) -> TestServer {
    let config = ServerConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        ..config
    };
    let server = Arc::new(ChatServer::bind(config, store.clone()).await.unwrap());
    let addr = server.local_addr().unwrap();
    let registry = server.registry();

    let running = server.clone();
    tokio::spawn(async move { running.run().await });

    TestServer {
        addr,
        registry,
        store,
        server,
    }
}

async fn start_default() -> TestServer {
    let config = ServerConfig {
        rooms: vec!["general".to_string(), "random".to_string()],
        ..ServerConfig::default()
    };
    start_server(config, Arc::new(MemoryStore::new())).await
}

async fn connect(addr: SocketAddr) -> (ChatClient, mpsc::UnboundedReceiver<ClientEvent>) {
    let config = ChatClientConfig {
        server_addr: addr,
        request_timeout_secs: 5,
        ..ChatClientConfig::default()
    };
    ChatClient::connect(config).await.unwrap()
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Raw socket speaking the wire format directly
struct RawClient {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl RawClient {
    async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            buf: Vec::new(),
        }
    }

    async fn send(&mut self, raw: &[u8]) {
        self.stream.write_all(raw).await.unwrap();
    }

    /// Read one `\r\n`-terminated frame, delimiter stripped
    async fn recv(&mut self) -> String {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let frame: Vec<u8> = self.buf.drain(..pos + 2).take(pos).collect();
                return String::from_utf8(frame).unwrap();
            }
            let mut chunk = [0u8; 1024];
            let n = timeout(WAIT, self.stream.read(&mut chunk))
                .await
                .expect("timed out waiting for frame")
                .unwrap();
            assert!(n > 0, "connection closed");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn request(&mut self, raw: &[u8]) -> String {
        self.send(raw).await;
        self.recv().await
    }
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn test_register_join_and_chat() {
    let server = start_default().await;
    let (alice, _alice_events) = connect(server.addr).await;
    let (bob, mut bob_events) = connect(server.addr).await;

    assert!(alice.register("alice", "pw1").await.unwrap());
    assert!(bob.register("bob", "pw2").await.unwrap());
    assert!(alice.join("general").await.unwrap());
    assert!(bob.join("general").await.unwrap());

    alice.send_message("hello").await.unwrap();
    assert_eq!(
        next_event(&mut bob_events).await,
        ClientEvent::Broadcast("[alice]: hello".to_string())
    );

    assert_eq!(alice.logs(10).await.unwrap(), vec!["[alice]: hello"]);
}

#[tokio::test]
async fn test_sender_does_not_receive_own_broadcast() {
    let server = start_default().await;
    let (alice, mut alice_events) = connect(server.addr).await;
    let (bob, mut bob_events) = connect(server.addr).await;

    alice.register("alice", "pw").await.unwrap();
    bob.register("bob", "pw").await.unwrap();
    alice.join("general").await.unwrap();
    bob.join("general").await.unwrap();

    alice.send_message("one").await.unwrap();
    bob.send_message("two").await.unwrap();

    assert_eq!(
        next_event(&mut bob_events).await,
        ClientEvent::Broadcast("[alice]: one".to_string())
    );
    assert_eq!(
        next_event(&mut alice_events).await,
        ClientEvent::Broadcast("[bob]: two".to_string())
    );
    assert!(alice_events.try_recv().is_err());
    assert!(bob_events.try_recv().is_err());
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let server = start_default().await;
    let (alice, _alice_events) = connect(server.addr).await;
    let (bob, mut bob_events) = connect(server.addr).await;
    let (carol, mut carol_events) = connect(server.addr).await;

    alice.register("alice", "pw").await.unwrap();
    bob.register("bob", "pw").await.unwrap();
    carol.register("carol", "pw").await.unwrap();
    alice.join("general").await.unwrap();
    bob.join("random").await.unwrap();
    carol.join("general").await.unwrap();

    alice.send_message("general only").await.unwrap();
    assert_eq!(
        next_event(&mut carol_events).await,
        ClientEvent::Broadcast("[alice]: general only".to_string())
    );

    // Switching rooms stops delivery from the old one
    carol.join("random").await.unwrap();
    alice.send_message("anyone?").await.unwrap();
    bob.send_message("random talk").await.unwrap();
    assert_eq!(
        next_event(&mut carol_events).await,
        ClientEvent::Broadcast("[bob]: random talk".to_string())
    );
    assert!(bob_events.try_recv().is_err());
}

#[tokio::test]
async fn test_login_and_duplicate_register() {
    let server = start_default().await;
    let (first, _events) = connect(server.addr).await;

    assert!(!first.login("dave", "pw").await.unwrap());
    assert!(first.register("dave", "pw").await.unwrap());
    assert!(!first.register("dave", "other").await.unwrap());

    let (second, _events) = connect(server.addr).await;
    assert!(!second.login("dave", "wrong").await.unwrap());
    assert!(second.login("dave", "pw").await.unwrap());
}

#[tokio::test]
async fn test_raw_protocol_replies() {
    let server = start_default().await;
    let mut raw = RawClient::connect(server.addr).await;

    assert_eq!(raw.request(b"MSG\nhello\r\n").await, "ERROR");
    assert_eq!(raw.request(b"LOGS\n5\r\n").await, "ERROR");
    assert_eq!(raw.request(b"MENU\nnowhere\r\n").await, "FALSE");
    assert_eq!(raw.request(b"JUMP\nhigh\r\n").await, "ERROR unknown_command");
    assert_eq!(raw.request(b"LOGIN\nonlyname\r\n").await, "ERROR");
    assert_eq!(raw.request(b"ROOMS\r\n").await, "general\nrandom");

    let general_id = server.store.room_id("general").unwrap().unwrap();
    assert_eq!(
        raw.request(b"MENU\nabc\ngeneral\r\n").await,
        format!("abc\n{}", general_id)
    );
    assert_eq!(raw.request(b"REGISTER\nerin\npw\r\n").await, "TRUE");
    assert_eq!(raw.request(b"LOGS\nq1\n10\r\n").await, "q1\n");
    assert_eq!(raw.request(b"MSG\nfirst\r\n").await, "TRUE");
    assert_eq!(raw.request(b"LOGS\n10\r\n").await, "[erin]: first");
}

#[tokio::test]
async fn test_pipelined_requests_answered_in_order() {
    let server = start_default().await;
    let mut raw = RawClient::connect(server.addr).await;

    raw.send(b"REGISTER\n1\nfrank\npw\r\nMENU\n2\nrandom\r\nMSG\n3\nhi\r\nLOGS\n4\n1\r\n")
        .await;

    let random_id = server.store.room_id("random").unwrap().unwrap();
    assert_eq!(raw.recv().await, "1\nTRUE");
    assert_eq!(raw.recv().await, format!("2\n{}", random_id));
    assert_eq!(raw.recv().await, "3\nTRUE");
    assert_eq!(raw.recv().await, "4\n[frank]: hi");
}

#[tokio::test]
async fn test_disconnect_removes_member() {
    let server = start_default().await;
    let (alice, _events) = connect(server.addr).await;
    let general = server.registry.get("general").unwrap();

    alice.register("alice", "pw").await.unwrap();
    alice.join("general").await.unwrap();
    assert_eq!(general.member_count(), 1);

    alice.close().await.unwrap();
    wait_for(|| general.member_count() == 0).await;
    wait_for(|| server.server.stats().active_sessions == 0).await;
}

#[tokio::test]
async fn test_broadcast_order_is_consistent_across_members() {
    let server = start_default().await;
    let mut listeners = Vec::new();
    for i in 0..3 {
        let (client, events) = connect(server.addr).await;
        client.register(&format!("listener{}", i), "pw").await.unwrap();
        client.join("general").await.unwrap();
        listeners.push((client, events));
    }

    let mut senders = Vec::new();
    for i in 0..3 {
        let (client, _events) = connect(server.addr).await;
        client.register(&format!("sender{}", i), "pw").await.unwrap();
        client.join("general").await.unwrap();
        senders.push(client);
    }

    let tasks: Vec<_> = senders
        .into_iter()
        .enumerate()
        .map(|(i, client)| {
            tokio::spawn(async move {
                for n in 0..20 {
                    client.send_message(&format!("{}-{}", i, n)).await.unwrap();
                }
                client
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let mut sequences = Vec::new();
    for (_client, events) in listeners.iter_mut() {
        let mut seen = Vec::new();
        while seen.len() < 60 {
            if let ClientEvent::Broadcast(line) = next_event(events).await {
                seen.push(line);
            }
        }
        sequences.push(seen);
    }

    assert_eq!(sequences[0], sequences[1]);
    assert_eq!(sequences[1], sequences[2]);

    // Each sender's own messages keep their order
    for i in 0..3 {
        let prefix = format!("[sender{}]: ", i);
        let own: Vec<&String> = sequences[0].iter().filter(|l| l.starts_with(&prefix)).collect();
        let expected: Vec<String> = (0..20).map(|n| format!("{}{}-{}", prefix, i, n)).collect();
        assert_eq!(own.len(), 20);
        for (got, want) in own.iter().zip(expected.iter()) {
            assert_eq!(*got, want);
        }
    }
}

#[tokio::test]
async fn test_connection_limit_rejects_excess() {
    let config = ServerConfig {
        max_connections: Some(1),
        ..ServerConfig::default()
    };
    let server = start_server(config, Arc::new(MemoryStore::new())).await;

    let (first, _events) = connect(server.addr).await;
    assert_eq!(first.rooms().await.unwrap(), vec!["general"]);

    let mut second = RawClient::connect(server.addr).await;
    assert_eq!(second.recv().await, "ERROR server_full");
    wait_for(|| server.server.stats().rejected_connections == 1).await;
}

#[tokio::test]
async fn test_history_survives_restart_with_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chat.db");

    {
        let store: Arc<dyn ChatStore> = Arc::new(SqliteStore::open(&path).unwrap());
        let server = start_server(ServerConfig::default(), store).await;
        let (client, _events) = connect(server.addr).await;
        client.register("gina", "pw").await.unwrap();
        client.join("general").await.unwrap();
        client.send_message("persisted").await.unwrap();
    }

    let store: Arc<dyn ChatStore> = Arc::new(SqliteStore::open(&path).unwrap());
    let server = start_server(ServerConfig::default(), store).await;
    let (client, _events) = connect(server.addr).await;
    assert!(client.login("gina", "pw").await.unwrap());
    client.join("general").await.unwrap();
    assert_eq!(client.logs(5).await.unwrap(), vec!["[gina]: persisted"]);
}
