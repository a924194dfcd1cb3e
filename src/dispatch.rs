//! Message-type routing and the built-in handlers.
//!
//! The handler table is copy-on-write: registration swaps in a new map, so a
//! dispatch that already looked up its handler finishes with it while every
//! later dispatch sees the replacement.

use crate::connection::ConnectionManager;
use crate::fieldbus::{FieldbusError, FieldbusMaster};
use crate::protocol::{self, Message, ProtocolError, UNKNOWN_REQUEST_ID};
use crate::state::{ServerState, TrafficCounters};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const STATUS_REQUEST: &str = "status_request";
pub const MARKING_REQUEST: &str = "marking_request";
pub const CONFIGURATION_UPDATE: &str = "configuration_update";
pub const SYSTEM_COMMAND: &str = "system_command";
pub const HEARTBEAT: &str = "heartbeat";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Hardware(#[from] FieldbusError),
    #[error("handler failed: {0}")]
    HandlerFailed(String),
}

impl DispatchError {
    /// Value of `error_type` in the error reply.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::UnknownMessageType(_) => "UnknownMessageType",
            DispatchError::Validation(_) => "ValidationError",
            DispatchError::Hardware(_) => "HardwareError",
            DispatchError::HandlerFailed(_) => "HandlerError",
        }
    }
}

/// A successful handler result: the reply's type and payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub message_type: String,
    pub payload: Value,
}

impl Reply {
    pub fn new(message_type: impl Into<String>, payload: Value) -> Self {
        Self {
            message_type: message_type.into(),
            payload,
        }
    }
}

pub type HandlerResult = Result<Reply, DispatchError>;
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// What a handler can see of the server.
#[derive(Clone)]
pub struct HandlerContext {
    pub state: Arc<ServerState>,
    pub connections: Arc<ConnectionManager>,
    pub shutdown_delay: Duration,
}

pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, ctx: HandlerContext, message: Message) -> HandlerFuture;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(HandlerContext, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, ctx: HandlerContext, message: Message) -> HandlerFuture {
        Box::pin(self(ctx, message))
    }
}

type HandlerTable = HashMap<String, Arc<dyn MessageHandler>>;

pub struct Router {
    handlers: RwLock<Arc<HandlerTable>>,
    context: HandlerContext,
}

impl Router {
    /// A router with only the built-in handlers. Marking runs in simulation.
    pub fn new(context: HandlerContext) -> Self {
        let router = Self {
            handlers: RwLock::new(Arc::new(HashMap::new())),
            context,
        };
        router.register_handler(STATUS_REQUEST, handle_status_request);
        router.register_handler(MARKING_REQUEST, handle_simulated_marking);
        router.register_handler(CONFIGURATION_UPDATE, handle_configuration_update);
        router.register_handler(SYSTEM_COMMAND, handle_system_command);
        router.register_handler(HEARTBEAT, handle_heartbeat);
        router
    }

    pub fn context(&self) -> &HandlerContext {
        &self.context
    }

    /// Install or replace the handler for `message_type`.
    pub fn register_handler(&self, message_type: &str, handler: impl MessageHandler) {
        let mut table = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = HandlerTable::clone(&table);
        let replaced = next.insert(message_type.to_string(), Arc::new(handler)).is_some();
        *table = Arc::new(next);
        if replaced {
            info!("Handler for {} replaced", message_type);
        } else {
            debug!("Handler for {} registered", message_type);
        }
    }

    pub fn message_types(&self) -> Vec<String> {
        let table = Arc::clone(&self.handlers.read().unwrap_or_else(PoisonError::into_inner));
        let mut types: Vec<String> = table.keys().cloned().collect();
        types.sort();
        types
    }

    fn lookup(&self, message_type: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(message_type)
            .cloned()
    }

    /// Decode one inbound line, stamp the sender and dispatch it.
    pub async fn handle_line(&self, client_id: &str, line: &str) -> Message {
        TrafficCounters::add(&self.context.state.traffic.messages_received, 1);
        match protocol::decode(line) {
            Ok(mut message) => {
                message.client_id = client_id.to_string();
                self.dispatch(message).await
            }
            Err(e) => {
                warn!("Malformed message from {}: {}", client_id, e);
                self.protocol_failure(protocol::recover_message_id(line).as_deref(), &e)
            }
        }
    }

    /// Error reply for a line that never became a message.
    pub fn protocol_failure(&self, request_id: Option<&str>, error: &ProtocolError) -> Message {
        TrafficCounters::add(&self.context.state.traffic.protocol_errors, 1);
        Message::error(request_id.unwrap_or(UNKNOWN_REQUEST_ID), "ProtocolError", error.to_string())
    }

    /// Route a message to its handler. Always produces exactly one reply.
    pub async fn dispatch(&self, message: Message) -> Message {
        let request_id = message.message_id.clone();
        debug!("Dispatching {} ({}) from {}", request_id, message.message_type, message.client_id);

        let result = match self.lookup(&message.message_type) {
            None => Err(DispatchError::UnknownMessageType(message.message_type.clone())),
            // A panicking handler only takes down its own task
            Some(handler) => match tokio::spawn(handler.handle(self.context.clone(), message)).await {
                Ok(result) => result,
                Err(join) => {
                    error!("Handler for {} aborted: {}", request_id, join);
                    Err(DispatchError::HandlerFailed(if join.is_panic() {
                        "handler panicked".to_string()
                    } else {
                        "handler cancelled".to_string()
                    }))
                }
            },
        };

        match result {
            Ok(reply) => Message::response(&request_id, reply.message_type, reply.payload),
            Err(e) => {
                TrafficCounters::add(&self.context.state.traffic.dispatch_errors, 1);
                warn!("Request {} failed: {}", request_id, e);
                Message::error(&request_id, e.kind(), e.to_string())
            }
        }
    }
}

/// The serial number to mark: `product_data.serial_number`, else `serial_number`.
pub fn serial_number(payload: &Value) -> Result<&str, DispatchError> {
    let candidate = payload
        .get("product_data")
        .and_then(|data| data.get("serial_number"))
        .or_else(|| payload.get("serial_number"));
    match candidate.and_then(Value::as_str) {
        Some(serial) if !serial.trim().is_empty() => Ok(serial),
        Some(_) => Err(DispatchError::Validation("serial_number must not be empty".to_string())),
        None => Err(DispatchError::Validation("Missing required field: serial_number".to_string())),
    }
}

fn product_data(payload: &Value, serial: &str) -> Value {
    match payload.get("product_data") {
        Some(data @ Value::Object(_)) => data.clone(),
        _ => json!({ "serial_number": serial }),
    }
}

fn mark_id(serial: &str) -> String {
    format!("MARK_{}_{}", serial, chrono::Utc::now().timestamp_millis())
}

async fn handle_status_request(ctx: HandlerContext, _message: Message) -> HandlerResult {
    let client_count = ctx.connections.client_count();
    let summary = ctx.state.summary(client_count);
    let hardware = ctx.state.hardware();
    let hardware_link = hardware
        .as_ref()
        .map_or("simulated", |master| master.link_state().as_str());

    // `connection` describes the requesting client's session, which is live
    let mut payload = json!({
        "system_status": summary,
        "connection": "connected",
        "hardware_link": hardware_link,
        "client_count": client_count,
    });
    if let Some(master) = hardware {
        payload["hardware"] = json!(master.system_status().await);
    }
    Ok(Reply::new("status_response", payload))
}

async fn handle_simulated_marking(ctx: HandlerContext, message: Message) -> HandlerResult {
    let serial = serial_number(&message.payload)?;
    info!("Simulated marking for serial {}", serial);

    let marks_completed = ctx.state.record_mark();
    Ok(Reply::new(
        "marking_response",
        json!({
            "success": true,
            "mark_id": mark_id(serial),
            "completion_time": protocol::now_iso8601(),
            "product_data": product_data(&message.payload, serial),
            "hardware_execution": false,
            "marks_completed": marks_completed,
        }),
    ))
}

/// Marking handler that drives the real cycle on `master`.
pub fn hardware_marking_handler(master: Arc<FieldbusMaster>) -> impl MessageHandler {
    move |ctx: HandlerContext, message: Message| run_hardware_marking(Arc::clone(&master), ctx, message)
}

async fn run_hardware_marking(master: Arc<FieldbusMaster>, ctx: HandlerContext, message: Message) -> HandlerResult {
    let serial = serial_number(&message.payload)?.to_string();
    info!("Hardware marking for serial {}", serial);

    let report = match master.run_marking_sequence().await {
        Ok(report) => report,
        Err(e) => {
            ctx.state.record_error();
            return Err(DispatchError::Hardware(e));
        }
    };

    let marks_completed = ctx.state.record_mark();
    Ok(Reply::new(
        "marking_response",
        json!({
            "success": true,
            "mark_id": mark_id(&serial),
            "completion_time": protocol::now_iso8601(),
            "product_data": product_data(&message.payload, &serial),
            "hardware_execution": true,
            "marks_completed": marks_completed,
            "plc_status": master.system_status().await,
            "cycle": report,
        }),
    ))
}

async fn handle_configuration_update(ctx: HandlerContext, message: Message) -> HandlerResult {
    let update: &Map<String, Value> = match message.payload.get("configuration") {
        Some(Value::Object(update)) => update,
        Some(_) => return Err(DispatchError::Validation("configuration must be an object".to_string())),
        None => return Err(DispatchError::Validation("Missing required field: configuration".to_string())),
    };
    let applied = ctx.state.apply_configuration(update);
    info!("Configuration updated: {:?}", applied);

    Ok(Reply::new(
        "configuration_response",
        json!({
            "success": true,
            "message": "Configuration updated",
            "applied_keys": applied,
        }),
    ))
}

async fn handle_system_command(ctx: HandlerContext, message: Message) -> HandlerResult {
    let command = message
        .payload_str("command")
        .ok_or_else(|| DispatchError::Validation("Missing required field: command".to_string()))?
        .to_string();

    let mut payload = json!({ "success": true, "command": command });
    match command.as_str() {
        "shutdown" => {
            warn!("🛑 Shutdown requested by {}", message.client_id);
            ctx.state.schedule_shutdown(ctx.shutdown_delay);
            payload["message"] = json!("Shutdown initiated");
        }
        "reset_statistics" => {
            ctx.state.reset_statistics();
            payload["message"] = json!("Statistics reset");
        }
        "system_test" => match ctx.state.hardware() {
            Some(master) if master.is_connected() => {
                payload["mode"] = json!("hardware");
                payload["hardware"] = json!(master.system_status().await);
            }
            _ => payload["mode"] = json!("simulated"),
        },
        other => {
            return Err(DispatchError::Validation(format!("Unknown system command: {}", other)));
        }
    }
    Ok(Reply::new("command_response", payload))
}

async fn handle_heartbeat(_ctx: HandlerContext, _message: Message) -> HandlerResult {
    Ok(Reply::new(
        "heartbeat_response",
        json!({ "status": "alive", "server_time": protocol::now_iso8601() }),
    ))
}
