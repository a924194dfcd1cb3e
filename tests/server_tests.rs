use marking_gateway::broadcast::{StatusBroadcaster, STATUS_BROADCAST};
use marking_gateway::config::ServerConfig;
use marking_gateway::connection::ConnectionError;
use marking_gateway::protocol::{self, Message};
use marking_gateway::state::ServerState;
use marking_gateway::MarkingServer;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

const REPLY_TIMEOUT: Duration = Duration::from_secs(3);

fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        max_message_bytes: 1024,
        write_timeout_ms: 1000,
        broadcast_interval_secs: 3600,
        shutdown_delay_ms: 50,
    }
}

async fn start_server() -> (MarkingServer, SocketAddr) {
    let server = MarkingServer::new(test_config(), Arc::new(ServerState::new()));
    let addr = server.start().await.unwrap();
    (server, addr)
}

struct TestClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let (reader, writer) = TcpStream::connect(addr).await.unwrap().into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    async fn send(&mut self, message: &Message) {
        let line = protocol::encode(message).unwrap();
        self.send_raw(line.as_bytes()).await;
    }

    async fn next_line(&mut self) -> Option<String> {
        tokio::time::timeout(REPLY_TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for the server")
            .unwrap_or(None)
    }

    async fn recv(&mut self) -> Message {
        let line = self.next_line().await.expect("connection closed");
        protocol::decode(&line).unwrap()
    }
}

async fn wait_for_clients(server: &MarkingServer, expected: usize) {
    for _ in 0..100 {
        if server.client_count() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("expected {} clients, have {}", expected, server.client_count());
}

#[tokio::test]
async fn test_heartbeat_round_trip() {
    let (server, addr) = start_server().await;
    let mut client = TestClient::connect(addr).await;

    client
        .send_raw(b"{\"message_id\":\"hb1\",\"timestamp\":\"2024-01-01T00:00:00Z\",\"message_type\":\"heartbeat\",\"payload\":{}}\n")
        .await;
    let reply = client.recv().await;

    assert_eq!(reply.message_id, "response_hb1");
    assert_eq!(reply.message_type, "heartbeat_response");
    assert!(reply.payload_str("server_time").is_some());
    server.stop().await;
}

#[tokio::test]
async fn test_pipelined_requests_answered_in_order() {
    let (server, addr) = start_server().await;
    let mut client = TestClient::connect(addr).await;

    let mut batch = String::new();
    for id in ["a", "b", "c"] {
        batch.push_str(&protocol::encode(&Message::new(id, "heartbeat", json!({}))).unwrap());
    }
    client.send_raw(batch.as_bytes()).await;

    for id in ["a", "b", "c"] {
        assert_eq!(client.recv().await.message_id, format!("response_{}", id));
    }
    server.stop().await;
}

#[tokio::test]
async fn test_record_split_across_writes() {
    let (server, addr) = start_server().await;
    let mut client = TestClient::connect(addr).await;

    let line = protocol::encode(&Message::new("split-1", "status_request", json!({}))).unwrap();
    let (head, tail) = line.as_bytes().split_at(line.len() / 2);
    client.send_raw(head).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.send_raw(tail).await;

    let reply = client.recv().await;
    assert_eq!(reply.message_id, "response_split-1");
    assert_eq!(reply.payload["client_count"], 1);
    server.stop().await;
}

#[tokio::test]
async fn test_malformed_line_keeps_connection_open() {
    let (server, addr) = start_server().await;
    let mut client = TestClient::connect(addr).await;

    client.send_raw(b"this is not json\n").await;
    let reply = client.recv().await;
    assert!(reply.is_error());
    assert_eq!(reply.message_id, "error_unknown");

    client.send(&Message::new("after", "heartbeat", json!({}))).await;
    assert_eq!(client.recv().await.message_id, "response_after");
    assert_eq!(server.stats().protocol_errors, 1);
    server.stop().await;
}

#[tokio::test]
async fn test_oversized_line_rejected() {
    let (server, addr) = start_server().await;
    let mut client = TestClient::connect(addr).await;

    let huge = format!("{}\n", "x".repeat(4096));
    client.send_raw(huge.as_bytes()).await;
    let reply = client.recv().await;
    assert!(reply.is_error());
    assert!(reply.payload_str("error").unwrap().contains("exceeds"));

    client.send(&Message::new("small", "heartbeat", json!({}))).await;
    assert_eq!(client.recv().await.message_id, "response_small");
    server.stop().await;
}

#[tokio::test]
async fn test_broadcast_reaches_remaining_clients() {
    let (server, addr) = start_server().await;
    let mut first = TestClient::connect(addr).await;
    let mut second = TestClient::connect(addr).await;
    let leaving = TestClient::connect(addr).await;
    wait_for_clients(&server, 3).await;

    drop(leaving);
    wait_for_clients(&server, 2).await;

    let broadcaster = StatusBroadcaster::new(
        Arc::clone(server.connections()),
        Arc::clone(server.state()),
        Duration::from_secs(3600),
    );
    let report = broadcaster.broadcast_once().await.unwrap();
    assert_eq!(report.delivered, 2);
    assert_eq!(report.failed, 0);

    for client in [&mut first, &mut second] {
        let message = client.recv().await;
        assert_eq!(message.message_type, STATUS_BROADCAST);
        assert!(message.message_id.starts_with("status_update_"));
        assert_eq!(message.payload["system_status"]["client_count"], 2);
    }
    server.stop().await;
}

#[tokio::test]
async fn test_client_info_lists_connections() {
    let (server, addr) = start_server().await;
    let _a = TestClient::connect(addr).await;
    let _b = TestClient::connect(addr).await;
    wait_for_clients(&server, 2).await;

    let info = server.client_info();
    assert_eq!(info.len(), 2);
    assert!(info.iter().all(|c| c.client_id.starts_with("client_")));
    assert_ne!(info[0].client_id, info[1].client_id);
    assert_eq!(server.stats().connections_accepted, 2);
    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_command_closes_clients() {
    let (server, addr) = start_server().await;
    let mut client = TestClient::connect(addr).await;

    client
        .send(&Message::new("bye", "system_command", json!({ "command": "shutdown" })))
        .await;
    let reply = client.recv().await;
    assert_eq!(reply.message_id, "response_bye");
    assert_eq!(reply.message_type, "command_response");

    // Server side closes after the delay
    assert_eq!(client.next_line().await, None);
    tokio::time::timeout(REPLY_TIMEOUT, server.stopped()).await.unwrap();
    wait_for_clients(&server, 0).await;
    assert!(!server.is_running());
}

#[tokio::test]
async fn test_restart_after_stop_is_refused() {
    let (server, addr) = start_server().await;
    server.stop().await;

    assert!(matches!(server.start().await, Err(ConnectionError::Stopped)));
    assert!(!server.is_running());
    assert_eq!(server.local_addr(), Some(addr));
}

#[tokio::test]
async fn test_bind_failure_is_reported() {
    let (first, addr) = start_server().await;

    let mut config = test_config();
    config.port = addr.port();
    let second = MarkingServer::new(config, Arc::new(ServerState::new()));
    match second.start().await {
        Err(ConnectionError::Bind { .. }) => {}
        other => panic!("expected bind failure, got {:?}", other.map(|a| a.to_string())),
    }
    assert!(!second.is_running());
    first.stop().await;
}
