//! Top-level wiring: the message server plus an optional fieldbus master.
//!
//! Marking requests run in simulation until the fieldbus link comes up, at
//! which point the hardware handler replaces the simulated one. Periodic
//! health checks retry the link while it is down.

use crate::config::GatewayConfig;
use crate::connection::ConnectionError;
use crate::dispatch::{hardware_marking_handler, MARKING_REQUEST};
use crate::fieldbus::FieldbusMaster;
use crate::io_points::IoRegistry;
use crate::server::MarkingServer;
use crate::state::ServerState;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub tcp_server: bool,
    /// `None` when the fieldbus is disabled.
    pub fieldbus: Option<bool>,
    pub overall: Health,
}

pub struct Gateway {
    config: GatewayConfig,
    server: MarkingServer,
    master: Option<Arc<FieldbusMaster>>,
    hardware_handler_installed: AtomicBool,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        let state = Arc::new(ServerState::new());
        let server = MarkingServer::new(config.server.clone(), Arc::clone(&state));

        let master = if config.fieldbus.enabled {
            let registry = Arc::new(IoRegistry::marking_station());
            let master = Arc::new(FieldbusMaster::new(
                config.fieldbus.clone(),
                config.marking.clone(),
                registry,
            ));
            state.set_hardware(Some(Arc::clone(&master)));
            Some(master)
        } else {
            None
        };

        Self {
            config,
            server,
            master,
            hardware_handler_installed: AtomicBool::new(false),
        }
    }

    pub fn server(&self) -> &MarkingServer {
        &self.server
    }

    pub fn master(&self) -> Option<&Arc<FieldbusMaster>> {
        self.master.as_ref()
    }

    pub fn hardware_mode(&self) -> bool {
        self.hardware_handler_installed.load(Ordering::Acquire)
    }

    /// Try the fieldbus link; on success route marking to the hardware.
    async fn connect_fieldbus(&self) -> bool {
        let Some(master) = &self.master else {
            return false;
        };
        match master.connect().await {
            Ok(()) => {
                if !self.hardware_handler_installed.swap(true, Ordering::AcqRel) {
                    self.server
                        .register_handler(MARKING_REQUEST, hardware_marking_handler(Arc::clone(master)));
                    info!("🔧 Marking requests now drive the controller");
                }
                true
            }
            Err(e) => {
                warn!("Fieldbus unavailable, marking stays simulated: {}", e);
                false
            }
        }
    }

    pub async fn start(&self) -> Result<SocketAddr, GatewayError> {
        if self.master.is_some() {
            self.connect_fieldbus().await;
        } else {
            info!("Fieldbus disabled, running in simulation mode");
        }
        let addr = self.server.start().await?;
        self.health_check().await;
        Ok(addr)
    }

    pub async fn health_check(&self) -> HealthReport {
        let tcp_server = self.server.is_running();
        let fieldbus = match &self.master {
            None => None,
            Some(master) if master.is_connected() => Some(true),
            Some(_) if self.config.health.reconnect => {
                info!("Fieldbus link down, reconnecting");
                Some(self.connect_fieldbus().await)
            }
            Some(_) => Some(false),
        };

        let overall = if tcp_server && fieldbus != Some(false) {
            Health::Healthy
        } else {
            Health::Degraded
        };
        info!(
            "Health check: tcp_server={} fieldbus={:?} overall={:?}",
            tcp_server, fieldbus, overall
        );
        HealthReport {
            tcp_server,
            fieldbus,
            overall,
        }
    }

    /// Periodic health checks until `shutdown` fires.
    pub async fn run_health_monitor(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.health.interval());
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.health_check().await;
                }
            }
        }
    }

    /// Resolves once shutdown has been requested, for example by a client.
    pub async fn stopped(&self) {
        self.server.stopped().await;
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.server.state().shutdown_token()
    }

    pub async fn shutdown(&self) {
        info!("Shutting down marking gateway");
        self.server.stop().await;
        if let Some(master) = &self.master {
            master.disconnect().await;
        }
    }
}
