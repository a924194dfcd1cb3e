use crate::fieldbus::FieldbusMaster;
use crate::protocol::now_iso8601;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Aggregate traffic counters. Read-only consumers (monitors) take snapshots.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    pub connections_accepted: AtomicU64,
    pub messages_received: AtomicU64,
    pub messages_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub dispatch_errors: AtomicU64,
    pub broadcasts_delivered: AtomicU64,
    pub broadcasts_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStats {
    pub connections_accepted: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub protocol_errors: u64,
    pub dispatch_errors: u64,
    pub broadcasts_delivered: u64,
    pub broadcasts_failed: u64,
}

impl TrafficCounters {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ServerStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ServerStats {
            connections_accepted: get(&self.connections_accepted),
            messages_received: get(&self.messages_received),
            messages_sent: get(&self.messages_sent),
            bytes_received: get(&self.bytes_received),
            bytes_sent: get(&self.bytes_sent),
            protocol_errors: get(&self.protocol_errors),
            dispatch_errors: get(&self.dispatch_errors),
            broadcasts_delivered: get(&self.broadcasts_delivered),
            broadcasts_failed: get(&self.broadcasts_failed),
        }
    }
}

/// The `system_status` document shared by status replies and broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSummary {
    pub controller_status: String,
    pub hardware_connected: bool,
    pub marks_completed: u64,
    pub error_count: u64,
    pub uptime: f64,
    pub client_count: usize,
    pub start_time: String,
    pub last_update: String,
}

/// State shared by every connection, handler and background task.
pub struct ServerState {
    started_at: Instant,
    start_time: String,
    marks_completed: AtomicU64,
    error_count: AtomicU64,
    last_update: Mutex<String>,
    configuration: RwLock<Map<String, Value>>,
    hardware: RwLock<Option<Arc<FieldbusMaster>>>,
    running: AtomicBool,
    shutdown: CancellationToken,
    pub traffic: TrafficCounters,
}

impl ServerState {
    pub fn new() -> Self {
        let now = now_iso8601();
        Self {
            started_at: Instant::now(),
            start_time: now.clone(),
            marks_completed: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            last_update: Mutex::new(now),
            configuration: RwLock::new(Map::new()),
            hardware: RwLock::new(None),
            running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            traffic: TrafficCounters::default(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn touch(&self) {
        *self.last_update.lock().unwrap_or_else(PoisonError::into_inner) = now_iso8601();
    }

    pub fn record_mark(&self) -> u64 {
        self.touch();
        self.marks_completed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_error(&self) {
        self.touch();
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn marks_completed(&self) -> u64 {
        self.marks_completed.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn reset_statistics(&self) {
        self.marks_completed.store(0, Ordering::Relaxed);
        self.error_count.store(0, Ordering::Relaxed);
        self.touch();
        info!("Marking statistics reset");
    }

    /// Merge a configuration document; returns the keys it carried.
    pub fn apply_configuration(&self, update: &Map<String, Value>) -> Vec<String> {
        let mut configuration = self.configuration.write().unwrap_or_else(PoisonError::into_inner);
        for (key, value) in update {
            configuration.insert(key.clone(), value.clone());
        }
        self.touch();
        update.keys().cloned().collect()
    }

    pub fn configuration(&self) -> Map<String, Value> {
        self.configuration.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_hardware(&self, master: Option<Arc<FieldbusMaster>>) {
        *self.hardware.write().unwrap_or_else(PoisonError::into_inner) = master;
    }

    pub fn hardware(&self) -> Option<Arc<FieldbusMaster>> {
        self.hardware.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn hardware_connected(&self) -> bool {
        self.hardware().map_or(false, |m| m.is_connected())
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Trigger an orderly stop after `delay`, giving the current reply time to flush.
    pub fn schedule_shutdown(&self, delay: Duration) {
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            token.cancel();
        });
    }

    pub fn summary(&self, client_count: usize) -> SystemSummary {
        let controller_status = if self.shutdown_requested() {
            "stopping"
        } else if self.is_running() {
            "ready"
        } else {
            "stopped"
        };
        SystemSummary {
            controller_status: controller_status.to_string(),
            hardware_connected: self.hardware_connected(),
            marks_completed: self.marks_completed(),
            error_count: self.error_count(),
            uptime: self.uptime().as_secs_f64(),
            client_count,
            start_time: self.start_time.clone(),
            last_update: self.last_update.lock().unwrap_or_else(PoisonError::into_inner).clone(),
        }
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}
