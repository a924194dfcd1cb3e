//! Client registry and per-connection I/O for the message server.
//!
//! Each accepted socket is split: the read half is owned by a reader task that
//! frames lines and dispatches them one at a time, so replies leave in request
//! order. The write half sits behind a per-client lock shared by replies and
//! broadcasts, which keeps every record on the wire whole.

use crate::config::ServerConfig;
use crate::dispatch::Router;
use crate::protocol::{self, LineFramer, Message, ProtocolError};
use crate::state::{ServerState, TrafficCounters};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const READ_CHUNK: usize = 4096;

pub type ClientId = String;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("i/o error on client {client}: {source}")]
    Io {
        client: ClientId,
        #[source]
        source: std::io::Error,
    },
    #[error("write to client {client} timed out after {after_ms} ms")]
    WriteTimeout { client: ClientId, after_ms: u64 },
    #[error("unknown client: {0}")]
    UnknownClient(ClientId),
    #[error("client {0} is closed")]
    Closed(ClientId),
    #[error("server has been stopped and cannot be restarted")]
    Stopped,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Descriptive view of a connected client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: ClientId,
    pub remote_addr: String,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

pub struct ClientHandle {
    id: ClientId,
    remote_addr: SocketAddr,
    connected_at: DateTime<Utc>,
    last_activity: Mutex<DateTime<Utc>>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    closed: CancellationToken,
}

impl ClientHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner) = Utc::now();
    }

    fn info(&self) -> ClientInfo {
        ClientInfo {
            client_id: self.id.clone(),
            remote_addr: self.remote_addr.to_string(),
            connected_at: self.connected_at,
            last_activity: *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }
}

fn new_client_id() -> ClientId {
    format!("client_{}", Uuid::new_v4().simple())
}

pub struct ConnectionManager {
    config: ServerConfig,
    state: Arc<ServerState>,
    clients: RwLock<HashMap<ClientId, Arc<ClientHandle>>>,
}

impl ConnectionManager {
    pub fn new(config: ServerConfig, state: Arc<ServerState>) -> Self {
        Self {
            config,
            state,
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn bind(&self) -> Result<TcpListener, ConnectionError> {
        let address = self.config.bind_address();
        TcpListener::bind(&address)
            .await
            .map_err(|source| ConnectionError::Bind { address, source })
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn client_info(&self) -> Vec<ClientInfo> {
        let mut info: Vec<ClientInfo> = self.snapshot().iter().map(|c| c.info()).collect();
        info.sort_by_key(|c| c.connected_at);
        info
    }

    fn snapshot(&self) -> Vec<Arc<ClientHandle>> {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn handle(&self, id: &str) -> Option<Arc<ClientHandle>> {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn register(&self, stream: TcpStream, remote_addr: SocketAddr) -> (Arc<ClientHandle>, OwnedReadHalf) {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        let now = Utc::now();
        let handle = Arc::new(ClientHandle {
            id: new_client_id(),
            remote_addr,
            connected_at: now,
            last_activity: Mutex::new(now),
            writer: tokio::sync::Mutex::new(writer),
            closed: CancellationToken::new(),
        });
        self.clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.id.clone(), Arc::clone(&handle));
        TrafficCounters::add(&self.state.traffic.connections_accepted, 1);
        (handle, reader)
    }

    /// Remove a client and stop its reader. Closing twice is a no-op.
    pub fn disconnect(&self, id: &str) -> bool {
        let removed = self
            .clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        match removed {
            Some(handle) => {
                handle.closed.cancel();
                info!("Client {} disconnected", id);
                true
            }
            None => false,
        }
    }

    pub fn disconnect_all(&self) {
        let drained: Vec<Arc<ClientHandle>> = self
            .clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in &drained {
            handle.closed.cancel();
        }
        if !drained.is_empty() {
            info!("Closed {} client connections", drained.len());
        }
    }

    async fn write_line(&self, handle: &ClientHandle, line: &str) -> Result<(), ConnectionError> {
        if handle.closed.is_cancelled() {
            return Err(ConnectionError::Closed(handle.id.clone()));
        }
        let limit = self.config.write_timeout();
        let write = async {
            let mut writer = handle.writer.lock().await;
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        };
        match tokio::time::timeout(limit, write).await {
            Ok(Ok(())) => {
                TrafficCounters::add(&self.state.traffic.messages_sent, 1);
                TrafficCounters::add(&self.state.traffic.bytes_sent, line.len() as u64);
                Ok(())
            }
            Ok(Err(source)) => Err(ConnectionError::Io {
                client: handle.id.clone(),
                source,
            }),
            Err(_) => Err(ConnectionError::WriteTimeout {
                client: handle.id.clone(),
                after_ms: self.config.write_timeout_ms,
            }),
        }
    }

    /// Deliver one message to one client. A client whose write fails is closed.
    pub async fn send(&self, id: &str, message: &Message) -> Result<(), ConnectionError> {
        let handle = self
            .handle(id)
            .ok_or_else(|| ConnectionError::UnknownClient(id.to_string()))?;
        let line = protocol::encode(message)?;
        let result = self.write_line(&handle, &line).await;
        if let Err(e) = &result {
            warn!("Send to {} failed: {}", id, e);
            self.disconnect(id);
        }
        result
    }

    /// Deliver one message to every client registered at the time of the call.
    pub async fn broadcast(&self, message: &Message) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let line = match protocol::encode(message) {
            Ok(line) => line,
            Err(e) => {
                error!("Broadcast {} not sent: {}", message.message_id, e);
                return report;
            }
        };

        // Writes run concurrently so a stalled client only holds up itself
        let targets = self.snapshot();
        let results = join_all(targets.iter().map(|handle| self.write_line(handle, &line))).await;
        for (handle, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!("Broadcast to {} failed: {}", handle.id, e);
                    self.disconnect(&handle.id);
                    report.failed += 1;
                }
            }
        }

        let traffic = &self.state.traffic;
        TrafficCounters::add(&traffic.broadcasts_delivered, report.delivered as u64);
        TrafficCounters::add(&traffic.broadcasts_failed, report.failed as u64);
        report
    }

    /// Accept connections until `shutdown` fires, spawning one reader per client.
    pub async fn accept_loop(self: Arc<Self>, listener: TcpListener, router: Arc<Router>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => {
                        let (handle, reader) = self.register(stream, remote_addr);
                        info!("📡 Client {} connected from {}", handle.id, remote_addr);
                        tokio::spawn(Arc::clone(&self).read_client(handle, reader, Arc::clone(&router)));
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                },
            }
        }
        debug!("Accept loop stopped");
    }

    async fn read_client(self: Arc<Self>, handle: Arc<ClientHandle>, mut reader: OwnedReadHalf, router: Arc<Router>) {
        let mut framer = LineFramer::new(self.config.max_message_bytes);
        let mut chunk = [0u8; READ_CHUNK];

        'session: loop {
            let n = tokio::select! {
                _ = handle.closed.cancelled() => break,
                read = reader.read(&mut chunk) => match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        debug!("Read from {} failed: {}", handle.id, e);
                        break;
                    }
                },
            };
            TrafficCounters::add(&self.state.traffic.bytes_received, n as u64);
            handle.touch();
            framer.push(&chunk[..n]);

            while let Some(line) = framer.next_line() {
                let reply = match line {
                    Ok(line) => router.handle_line(&handle.id, &line).await,
                    Err(e) => router.protocol_failure(None, &e),
                };
                if self.send(&handle.id, &reply).await.is_err() {
                    break 'session;
                }
            }
        }

        self.disconnect(&handle.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ids_are_unique_and_prefixed() {
        let a = new_client_id();
        let b = new_client_id();
        assert!(a.starts_with("client_"));
        assert_eq!(a.len(), "client_".len() + 32);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn unknown_client_send_is_an_error() {
        let manager = ConnectionManager::new(ServerConfig::default(), Arc::new(ServerState::new()));
        let message = Message::new("m1", "heartbeat", serde_json::json!({}));
        let err = manager.send("client_missing", &message).await.unwrap_err();
        assert!(matches!(err, ConnectionError::UnknownClient(_)));
        // disconnecting an unknown id never raises
        assert!(!manager.disconnect("client_missing"));
        assert_eq!(manager.client_count(), 0);
    }

    async fn socket_pair(listener: &TcpListener) -> (TcpStream, TcpStream, SocketAddr) {
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (client, server, peer)
    }

    #[tokio::test]
    async fn broadcast_failure_removes_only_the_failed_client() {
        let manager = ConnectionManager::new(ServerConfig::default(), Arc::new(ServerState::new()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let (_healthy_client, healthy, peer) = socket_pair(&listener).await;
        let (_broken_client, broken, broken_peer) = socket_pair(&listener).await;
        let (healthy, _healthy_reader) = manager.register(healthy, peer);
        let (broken, _broken_reader) = manager.register(broken, broken_peer);

        // Closed but not yet reaped, as when a reader is still winding down
        broken.closed.cancel();

        let report = manager
            .broadcast(&Message::new("status_update_2", "status_broadcast", serde_json::json!({})))
            .await;
        assert_eq!(report, BroadcastReport { delivered: 1, failed: 1 });
        assert_eq!(manager.client_ids(), vec![healthy.id().to_string()]);
    }

    #[tokio::test]
    async fn broadcast_drops_client_whose_socket_write_fails() {
        let manager = ConnectionManager::new(ServerConfig::default(), Arc::new(ServerState::new()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let (_healthy_client, healthy, peer) = socket_pair(&listener).await;
        let (_broken_client, broken, broken_peer) = socket_pair(&listener).await;
        let (healthy, _healthy_reader) = manager.register(healthy, peer);
        let (broken, _broken_reader) = manager.register(broken, broken_peer);

        // Writes after a local shutdown fail with a broken pipe
        broken.writer.lock().await.shutdown().await.unwrap();

        let report = manager
            .broadcast(&Message::new("status_update_3", "status_broadcast", serde_json::json!({})))
            .await;
        assert_eq!(report, BroadcastReport { delivered: 1, failed: 1 });
        assert_eq!(manager.client_ids(), vec![healthy.id().to_string()]);
        assert!(broken.closed.is_cancelled());
    }

    #[tokio::test]
    async fn stalled_client_does_not_delay_broadcast_to_others() {
        let config = ServerConfig {
            write_timeout_ms: 1500,
            ..ServerConfig::default()
        };
        let manager = ConnectionManager::new(config, Arc::new(ServerState::new()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let (_stalled_client, stalled, stalled_peer) = socket_pair(&listener).await;
        let (stalled, _stalled_reader) = manager.register(stalled, stalled_peer);
        let mut healthy_clients = Vec::new();
        for _ in 0..4 {
            let (client, server_side, peer) = socket_pair(&listener).await;
            let _ = manager.register(server_side, peer);
            healthy_clients.push(client);
        }

        let writer_guard = stalled.writer.lock().await;
        let message = Message::new("status_update_4", "status_broadcast", serde_json::json!({}));
        let receive_all = async {
            let started = std::time::Instant::now();
            for client in healthy_clients.iter_mut() {
                let mut buf = [0u8; 256];
                let n = tokio::time::timeout(std::time::Duration::from_millis(500), client.read(&mut buf))
                    .await
                    .expect("healthy client waited behind the stalled one")
                    .unwrap();
                assert!(n > 0);
            }
            started.elapsed()
        };
        let (report, elapsed) = tokio::join!(manager.broadcast(&message), receive_all);
        drop(writer_guard);

        assert!(elapsed < std::time::Duration::from_millis(500));
        assert_eq!(report, BroadcastReport { delivered: 4, failed: 1 });
        assert_eq!(manager.client_count(), 4);
    }

    #[tokio::test]
    async fn broadcast_with_no_clients_delivers_nothing() {
        let manager = ConnectionManager::new(ServerConfig::default(), Arc::new(ServerState::new()));
        let report = manager
            .broadcast(&Message::new("status_update_1", "status_broadcast", serde_json::json!({})))
            .await;
        assert_eq!(report, BroadcastReport::default());
    }
}
