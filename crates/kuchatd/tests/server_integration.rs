//! Integration tests for the TCP server.
//!
//! These tests verify the ChatServer works correctly as a complete system,
//! testing the identify handshake, routing between sockets and graceful
//! shutdown.
//!
//! Tests CAN use `.unwrap()` and `.expect()` - this is allowed.
//! We test the panic-free behavior of production code through assertions.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use kuchat_core::UserId;
use kuchat_protocol::{kind, Frame};
use kuchatd::config::{ConnectionConfig, ServerConfig};
use kuchatd::{default_dispatcher, ChatServer, Hub, Registry};

// ============================================================================
// Constants
// ============================================================================

/// Maximum time to wait for a single event
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Handshake deadline used by the test server
const HANDSHAKE_TIMEOUT_MS: u64 = 200;

/// Interval between registry state checks
const POLL_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Test Helpers
// ============================================================================

/// Test server context that manages server lifecycle.
struct TestServer {
    addr: SocketAddr,
    registry: Registry,
    cancel_token: CancellationToken,
}

impl TestServer {
    /// Spawns a server on an ephemeral port.
    async fn spawn() -> Self {
        let registry = Registry::new(100);
        let dispatcher = default_dispatcher(&registry).expect("build dispatcher");
        let hub = Hub::new(registry.clone(), dispatcher, ConnectionConfig::default());

        let config = ServerConfig {
            listen: "127.0.0.1:0".to_string(),
            handshake_timeout_ms: HANDSHAKE_TIMEOUT_MS,
        };
        let cancel_token = CancellationToken::new();

        let server = ChatServer::bind(&config, hub, cancel_token.clone())
            .await
            .expect("bind server");
        let addr = server.local_addr().expect("local addr");

        tokio::spawn(async move {
            let _ = server.run().await;
        });

        TestServer {
            addr,
            registry,
            cancel_token,
        }
    }

    /// Opens a raw connection without identifying.
    async fn connect(&self) -> TestClient {
        let stream = TcpStream::connect(self.addr)
            .await
            .expect("connect to server");
        TestClient {
            framed: Framed::new(stream, LengthDelimitedCodec::new()),
        }
    }

    /// Connects and completes the handshake as `user`.
    async fn login(&self, user: &str) -> TestClient {
        let mut client = self.connect().await;
        client.send(kind::IDENTIFY, json!({ "user_id": user })).await;

        let greeting = client.recv().await;
        assert_eq!(greeting["id"], 1, "expected Connected, got {greeting}");
        assert_eq!(greeting["data"]["user_id"], user);
        client
    }

    /// Polls until `check` passes or the receive timeout elapses.
    async fn wait_until(&self, check: impl Fn(&Registry) -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < RECV_TIMEOUT {
            if check(&self.registry) {
                return true;
            }
            sleep(POLL_INTERVAL).await;
        }
        check(&self.registry)
    }

    fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Test client connection with protocol helpers.
struct TestClient {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

impl TestClient {
    /// Sends a frame with a JSON payload.
    async fn send(&mut self, kind: u32, payload: Value) {
        let body = serde_json::to_vec(&payload).unwrap();
        self.send_raw(Frame::new(kind, body).to_bytes()).await;
    }

    async fn send_raw(&mut self, body: Bytes) {
        self.framed.send(body).await.unwrap();
    }

    async fn recv_raw(&mut self) -> BytesMut {
        timeout(RECV_TIMEOUT, self.framed.next())
            .await
            .expect("timed out waiting for message")
            .expect("connection closed")
            .expect("decode message")
    }

    /// Receives the next message as a JSON envelope.
    async fn recv(&mut self) -> Value {
        let body = self.recv_raw().await;
        serde_json::from_slice(&body).unwrap()
    }

    /// Waits for the server to close the connection.
    async fn expect_closed(&mut self) {
        let next = timeout(RECV_TIMEOUT, self.framed.next())
            .await
            .expect("timed out waiting for close");
        if let Some(Ok(body)) = next {
            panic!("expected close, got message: {:?}", body);
        }
    }
}

// ============================================================================
// Handshake Tests
// ============================================================================

#[tokio::test]
async fn test_identify_registers_user() {
    let server = TestServer::spawn().await;

    let _client = server.login("alice").await;

    assert!(
        server
            .wait_until(|r| r.get(&UserId::new("alice")).is_some())
            .await
    );
    assert_eq!(server.registry.online_users(), vec![UserId::new("alice")]);
}

#[tokio::test]
async fn test_numeric_user_id_accepted() {
    let server = TestServer::spawn().await;

    let mut client = server.connect().await;
    client.send(kind::IDENTIFY, json!({ "user_id": 42 })).await;

    let greeting = client.recv().await;
    assert_eq!(greeting["id"], 1);
    assert_eq!(greeting["data"]["user_id"], "42");
}

#[tokio::test]
async fn test_first_frame_must_identify() {
    let server = TestServer::spawn().await;

    let mut client = server.connect().await;
    client.send(kind::PING, json!({ "seq": 1 })).await;

    let error = client.recv().await;
    assert_eq!(error["id"], 0);
    assert_eq!(error["data"]["kind"], kind::IDENTIFY);
    client.expect_closed().await;
    assert!(server.registry.is_empty());
}

#[tokio::test]
async fn test_malformed_identify_rejected() {
    let server = TestServer::spawn().await;

    let mut client = server.connect().await;
    client
        .send(kind::IDENTIFY, json!({ "user_id": "   " }))
        .await;

    let error = client.recv().await;
    assert_eq!(error["id"], 0);
    client.expect_closed().await;
    assert!(server.registry.is_empty());
}

#[tokio::test]
async fn test_incompatible_version_rejected() {
    let server = TestServer::spawn().await;

    let mut client = server.connect().await;
    client
        .send(
            kind::IDENTIFY,
            json!({
                "user_id": "alice",
                "protocol_version": { "major": 9, "minor": 0 }
            }),
        )
        .await;

    let error = client.recv().await;
    assert_eq!(error["id"], 0);
    assert!(error["data"]["message"]
        .as_str()
        .unwrap()
        .contains("version"));
    client.expect_closed().await;
}

#[tokio::test]
async fn test_silent_client_times_out() {
    let server = TestServer::spawn().await;

    let mut client = server.connect().await;

    let error = client.recv().await;
    assert_eq!(error["id"], 0);
    client.expect_closed().await;
    assert!(server.registry.is_empty());
}

#[tokio::test]
async fn test_frames_sent_with_identify_are_not_lost() {
    let server = TestServer::spawn().await;

    let mut client = server.connect().await;

    // Identify and ping in a single write
    let identify = serde_json::to_vec(&json!({ "user_id": "alice" })).unwrap();
    let ping = serde_json::to_vec(&json!({ "seq": 11 })).unwrap();
    client
        .framed
        .feed(Frame::new(kind::IDENTIFY, identify).to_bytes())
        .await
        .unwrap();
    client
        .framed
        .feed(Frame::new(kind::PING, ping).to_bytes())
        .await
        .unwrap();
    SinkExt::<Bytes>::flush(&mut client.framed).await.unwrap();

    assert_eq!(client.recv().await["id"], 1);
    assert_eq!(client.recv().await, json!({ "id": 4, "data": { "seq": 11 } }));
}

// ============================================================================
// Routing Tests
// ============================================================================

#[tokio::test]
async fn test_friend_request_between_sockets() {
    let server = TestServer::spawn().await;

    let mut alice = server.login("alice").await;
    let mut bob = server.login("bob").await;

    alice
        .send(
            kind::FRIEND_REQUEST,
            json!({ "target_id": "bob", "remark": "let's chat" }),
        )
        .await;

    assert_eq!(
        bob.recv().await,
        json!({ "id": 2, "data": { "user": "alice", "remark": "let's chat" } })
    );
}

#[tokio::test]
async fn test_relogin_over_tcp_replaces_socket() {
    let server = TestServer::spawn().await;

    let mut first = server.login("alice").await;
    let mut second = server.login("alice").await;

    assert_eq!(first.recv().await["id"], 3);
    first.expect_closed().await;

    second.send(kind::PING, json!({ "seq": 5 })).await;
    assert_eq!(second.recv().await["data"]["seq"], 5);
    assert_eq!(server.registry.len(), 1);
}

// ============================================================================
// Shutdown Tests
// ============================================================================

#[tokio::test]
async fn test_shutdown_closes_connections() {
    let server = TestServer::spawn().await;

    let mut alice = server.login("alice").await;
    let mut bob = server.login("bob").await;

    server.shutdown();

    alice.expect_closed().await;
    bob.expect_closed().await;
    assert!(server.wait_until(|r| r.is_empty()).await);
}

#[tokio::test]
async fn test_identify_after_shutdown_is_not_registered() {
    let server = TestServer::spawn().await;

    let mut client = server.connect().await;
    // Give the server a moment to accept before shutting down
    sleep(Duration::from_millis(50)).await;
    server.shutdown();
    sleep(Duration::from_millis(50)).await;

    client.send(kind::IDENTIFY, json!({ "user_id": "alice" })).await;

    client.expect_closed().await;
    assert!(server.wait_until(|r| r.is_empty()).await);
}

#[tokio::test]
async fn test_disconnect_then_push_finds_user_offline() {
    let server = TestServer::spawn().await;

    let mut alice = server.login("alice").await;
    let bob = server.login("bob").await;

    drop(bob);
    assert!(
        server
            .wait_until(|r| r.get(&UserId::new("bob")).is_none())
            .await
    );

    alice
        .send(kind::FRIEND_REQUEST, json!({ "target_id": "bob" }))
        .await;
    let error = alice.recv().await;
    assert_eq!(error["id"], 0);
    assert_eq!(error["data"]["kind"], kind::FRIEND_REQUEST);
}
