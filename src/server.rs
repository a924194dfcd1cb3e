use crate::broadcast::StatusBroadcaster;
use crate::config::ServerConfig;
use crate::connection::{ClientInfo, ConnectionError, ConnectionManager};
use crate::dispatch::{HandlerContext, MessageHandler, Router};
use crate::state::{ServerState, ServerStats};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// The TCP message server: listener, clients, router and status broadcasts.
///
/// Stopping is final; the shutdown token it watches cannot be re-armed.
pub struct MarkingServer {
    config: ServerConfig,
    state: Arc<ServerState>,
    connections: Arc<ConnectionManager>,
    router: Arc<Router>,
    local_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MarkingServer {
    pub fn new(config: ServerConfig, state: Arc<ServerState>) -> Self {
        let connections = Arc::new(ConnectionManager::new(config.clone(), Arc::clone(&state)));
        let router = Arc::new(Router::new(HandlerContext {
            state: Arc::clone(&state),
            connections: Arc::clone(&connections),
            shutdown_delay: config.shutdown_delay(),
        }));
        Self {
            config,
            state,
            connections,
            router,
            local_addr: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn register_handler(&self, message_type: &str, handler: impl MessageHandler) {
        self.router.register_handler(message_type, handler);
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn client_count(&self) -> usize {
        self.connections.client_count()
    }

    pub fn client_info(&self) -> Vec<ClientInfo> {
        self.connections.client_info()
    }

    pub fn stats(&self) -> ServerStats {
        self.state.traffic.snapshot()
    }

    /// Bind and begin accepting. A bind failure is returned and nothing is spawned.
    pub async fn start(&self) -> Result<SocketAddr, ConnectionError> {
        if self.state.shutdown_requested() {
            return Err(ConnectionError::Stopped);
        }
        if let Some(addr) = self.local_addr().filter(|_| self.is_running()) {
            return Ok(addr);
        }

        let listener = self.connections.bind().await?;
        let addr = listener.local_addr().map_err(|source| ConnectionError::Bind {
            address: self.config.bind_address(),
            source,
        })?;
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(addr);
        self.state.set_running(true);

        let shutdown = self.state.shutdown_token();
        let broadcaster = StatusBroadcaster::new(
            Arc::clone(&self.connections),
            Arc::clone(&self.state),
            self.config.broadcast_interval(),
        );

        let accept = tokio::spawn(Arc::clone(&self.connections).accept_loop(
            listener,
            Arc::clone(&self.router),
            shutdown.clone(),
        ));
        let broadcasts = tokio::spawn(broadcaster.run(shutdown.clone()));

        // Tear down clients however the stop was requested
        let connections = Arc::clone(&self.connections);
        let state = Arc::clone(&self.state);
        let teardown = tokio::spawn(async move {
            shutdown.cancelled().await;
            state.set_running(false);
            connections.disconnect_all();
        });

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([accept, broadcasts, teardown]);

        info!("🚀 Marking server listening on {}", addr);
        Ok(addr)
    }

    pub async fn stop(&self) {
        self.state.shutdown_token().cancel();
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Server task ended abnormally: {}", e);
            }
        }
        self.state.set_running(false);
        self.connections.disconnect_all();
        info!("Marking server stopped");
    }

    /// Resolves once a stop has been requested, locally or by a client.
    pub async fn stopped(&self) {
        self.state.shutdown_token().cancelled().await;
    }
}
