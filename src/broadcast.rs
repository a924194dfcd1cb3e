use crate::connection::{BroadcastReport, ConnectionManager};
use crate::protocol::Message;
use crate::state::ServerState;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const STATUS_BROADCAST: &str = "status_broadcast";

/// Periodically pushes the system summary to every connected client.
pub struct StatusBroadcaster {
    connections: Arc<ConnectionManager>,
    state: Arc<ServerState>,
    period: Duration,
}

impl StatusBroadcaster {
    pub fn new(connections: Arc<ConnectionManager>, state: Arc<ServerState>, period: Duration) -> Self {
        Self {
            connections,
            state,
            period,
        }
    }

    pub fn status_message(&self) -> Message {
        let summary = self.state.summary(self.connections.client_count());
        Message::new(
            format!("status_update_{}", Utc::now().timestamp_millis()),
            STATUS_BROADCAST,
            json!({ "system_status": summary }),
        )
    }

    /// One broadcast round; `None` when nobody is connected.
    pub async fn broadcast_once(&self) -> Option<BroadcastReport> {
        if self.connections.client_count() == 0 {
            return None;
        }
        let report = self.connections.broadcast(&self.status_message()).await;
        debug!(
            "Status broadcast delivered to {} clients ({} failed)",
            report.delivered, report.failed
        );
        Some(report)
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.period);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.broadcast_once().await;
                }
            }
        }
    }
}
