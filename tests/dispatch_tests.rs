use marking_gateway::config::{FieldbusConfig, MarkingConfig, ServerConfig};
use marking_gateway::connection::ConnectionManager;
use marking_gateway::dispatch::{hardware_marking_handler, DispatchError, HandlerResult, MARKING_REQUEST};
use marking_gateway::fieldbus::{ControllerBehavior, FieldbusMaster, SimulatedController};
use marking_gateway::io_points::{discrete_input, IoRegistry};
use marking_gateway::state::ServerState;
use marking_gateway::{HandlerContext, Message, Reply, Router};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    state: Arc<ServerState>,
    router: Router,
}

fn harness() -> Harness {
    let state = Arc::new(ServerState::new());
    state.set_running(true);
    let connections = Arc::new(ConnectionManager::new(ServerConfig::default(), Arc::clone(&state)));
    let router = Router::new(HandlerContext {
        state: Arc::clone(&state),
        connections,
        shutdown_delay: Duration::from_millis(200),
    });
    Harness { state, router }
}

fn request(id: &str, message_type: &str, payload: serde_json::Value) -> Message {
    Message::new(id, message_type, payload)
}

async fn panicking_handler(_ctx: HandlerContext, _message: Message) -> HandlerResult {
    panic!("handler exploded");
}

#[tokio::test]
async fn test_heartbeat_reply() {
    let h = harness();
    let reply = h.router.dispatch(request("hb-1", "heartbeat", json!({}))).await;

    assert_eq!(reply.message_id, "response_hb-1");
    assert_eq!(reply.message_type, "heartbeat_response");
    assert_eq!(reply.payload["status"], "alive");
    assert!(reply.payload_str("server_time").is_some());
}

#[tokio::test]
async fn test_status_without_clients_or_hardware() {
    let h = harness();
    let reply = h.router.dispatch(request("s-1", "status_request", json!({}))).await;

    assert_eq!(reply.message_id, "response_s-1");
    assert_eq!(reply.message_type, "status_response");
    assert_eq!(reply.payload["client_count"], 0);
    assert_eq!(reply.payload["connection"], "connected");
    assert_eq!(reply.payload["hardware_link"], "simulated");
    assert!(reply.payload.get("error").is_none());
    assert_eq!(reply.payload["system_status"]["client_count"], 0);
    assert_eq!(reply.payload["system_status"]["controller_status"], "ready");
    assert_eq!(reply.payload["system_status"]["hardware_connected"], false);
    assert!(reply.payload.get("hardware").is_none());
}

#[tokio::test]
async fn test_status_reports_connected_link() {
    let h = harness();
    let plc = SimulatedController::start("127.0.0.1:0", ControllerBehavior::default())
        .await
        .unwrap();
    let master = Arc::new(FieldbusMaster::new(
        FieldbusConfig::modbus_tcp("127.0.0.1", plc.local_addr().port()),
        MarkingConfig::default(),
        Arc::new(IoRegistry::marking_station()),
    ));
    master.connect().await.unwrap();
    h.state.set_hardware(Some(master));

    let reply = h.router.dispatch(request("s-2", "status_request", json!({}))).await;
    assert_eq!(reply.payload["client_count"], 0);
    assert_eq!(reply.payload["connection"], "connected");
    assert_eq!(reply.payload["hardware_link"], "connected");
    assert_eq!(reply.payload["system_status"]["hardware_connected"], true);
    assert_eq!(reply.payload["hardware"]["discrete_inputs"]["System Ready"], true);
}

#[tokio::test]
async fn test_simulated_marking() {
    let h = harness();
    let reply = h
        .router
        .dispatch(request(
            "m-1",
            "marking_request",
            json!({ "product_data": { "serial_number": "SN-1001", "batch": "B7" } }),
        ))
        .await;

    assert_eq!(reply.message_id, "response_m-1");
    assert_eq!(reply.message_type, "marking_response");
    assert_eq!(reply.payload["success"], true);
    assert_eq!(reply.payload["hardware_execution"], false);
    assert_eq!(reply.payload["product_data"]["batch"], "B7");
    assert!(reply.payload_str("mark_id").unwrap().contains("SN-1001"));
    assert_eq!(h.state.marks_completed(), 1);
}

#[tokio::test]
async fn test_marking_without_serial_is_validation_error() {
    let h = harness();
    let reply = h
        .router
        .dispatch(request("m-2", "marking_request", json!({ "product_data": {} })))
        .await;

    assert!(reply.is_error());
    assert_eq!(reply.message_id, "error_m-2");
    assert_eq!(reply.payload["error_type"], "ValidationError");
    assert_eq!(h.state.marks_completed(), 0);
}

#[tokio::test]
async fn test_unknown_message_type() {
    let h = harness();
    let reply = h.router.dispatch(request("u-1", "warp_drive", json!({}))).await;

    assert_eq!(reply.message_id, "error_u-1");
    assert_eq!(reply.payload["error_type"], "UnknownMessageType");
    assert!(reply.payload_str("error").unwrap().contains("warp_drive"));
}

#[tokio::test]
async fn test_handler_replacement_takes_effect() {
    let h = harness();
    h.router.register_handler("heartbeat", |_ctx: HandlerContext, _message: Message| async {
        Ok::<_, DispatchError>(Reply::new("custom_heartbeat", json!({ "replaced": true })))
    });

    let reply = h.router.dispatch(request("hb-2", "heartbeat", json!({}))).await;
    assert_eq!(reply.message_type, "custom_heartbeat");
    assert_eq!(reply.payload["replaced"], true);

    // New types can be added at runtime
    h.router.register_handler("echo", |_ctx: HandlerContext, message: Message| async move {
        Ok::<_, DispatchError>(Reply::new("echo_response", message.payload))
    });
    let reply = h.router.dispatch(request("e-1", "echo", json!({ "x": 1 }))).await;
    assert_eq!(reply.payload, json!({ "x": 1 }));
    assert!(h.router.message_types().contains(&"echo".to_string()));
}

#[tokio::test]
async fn test_panicking_handler_becomes_error_reply() {
    let h = harness();
    h.router.register_handler("explode", panicking_handler);

    let reply = h.router.dispatch(request("p-1", "explode", json!({}))).await;
    assert_eq!(reply.message_id, "error_p-1");
    assert_eq!(reply.payload["error_type"], "HandlerError");

    // The router keeps serving
    let reply = h.router.dispatch(request("hb-3", "heartbeat", json!({}))).await;
    assert_eq!(reply.message_type, "heartbeat_response");
}

#[tokio::test]
async fn test_configuration_update() {
    let h = harness();
    let reply = h
        .router
        .dispatch(request(
            "c-1",
            "configuration_update",
            json!({ "configuration": { "laser_power": 75, "vendor_specific": { "a": 1 } } }),
        ))
        .await;
    assert_eq!(reply.message_type, "configuration_response");
    assert_eq!(reply.payload["success"], true);
    assert_eq!(h.state.configuration()["laser_power"], 75);

    let reply = h
        .router
        .dispatch(request("c-2", "configuration_update", json!({ "configuration": 5 })))
        .await;
    assert_eq!(reply.payload["error_type"], "ValidationError");
}

#[tokio::test]
async fn test_system_commands() {
    let h = harness();
    h.state.record_mark();
    h.state.record_error();

    let reply = h
        .router
        .dispatch(request("cmd-1", "system_command", json!({ "command": "reset_statistics" })))
        .await;
    assert_eq!(reply.message_type, "command_response");
    assert_eq!(h.state.marks_completed(), 0);
    assert_eq!(h.state.error_count(), 0);

    let reply = h
        .router
        .dispatch(request("cmd-2", "system_command", json!({ "command": "system_test" })))
        .await;
    assert_eq!(reply.payload["mode"], "simulated");

    let reply = h
        .router
        .dispatch(request("cmd-3", "system_command", json!({ "command": "self_destruct" })))
        .await;
    assert_eq!(reply.message_id, "error_cmd-3");
    assert_eq!(reply.payload["error_type"], "ValidationError");
}

#[tokio::test]
async fn test_shutdown_command_is_delayed() {
    let h = harness();
    let reply = h
        .router
        .dispatch(request("cmd-4", "system_command", json!({ "command": "shutdown" })))
        .await;

    // The reply goes out before the stop takes effect
    assert_eq!(reply.message_type, "command_response");
    assert!(!h.state.shutdown_requested());

    tokio::time::timeout(Duration::from_secs(2), h.state.shutdown_token().cancelled())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_malformed_lines() {
    let h = harness();

    let reply = h.router.handle_line("client_a", "{not json").await;
    assert_eq!(reply.message_id, "error_unknown");
    assert_eq!(reply.payload["error_type"], "ProtocolError");

    // Recoverable id, missing fields
    let reply = h
        .router
        .handle_line("client_a", r#"{"message_id":"bad-1","payload":{}}"#)
        .await;
    assert_eq!(reply.message_id, "error_bad-1");

    assert_eq!(h.state.traffic.snapshot().protocol_errors, 2);
}

#[tokio::test]
async fn test_hardware_marking() {
    let h = harness();
    let plc = SimulatedController::start("127.0.0.1:0", ControllerBehavior::auto_complete(Duration::from_millis(20)))
        .await
        .unwrap();
    let master = Arc::new(FieldbusMaster::new(
        FieldbusConfig::modbus_tcp("127.0.0.1", plc.local_addr().port()),
        MarkingConfig {
            poll_interval_ms: 10,
            completion_timeout_ms: 1000,
            cycle_hold_ms: 10,
        },
        Arc::new(IoRegistry::marking_station()),
    ));
    master.connect().await.unwrap();
    h.router
        .register_handler(MARKING_REQUEST, hardware_marking_handler(Arc::clone(&master)));

    let reply = h
        .router
        .dispatch(request("hm-1", "marking_request", json!({ "serial_number": "SN-7" })))
        .await;
    assert_eq!(reply.message_type, "marking_response");
    assert_eq!(reply.payload["hardware_execution"], true);
    assert_eq!(reply.payload["plc_status"]["connection"], "connected");
    assert_eq!(h.state.marks_completed(), 1);

    // Validation happens before the fieldbus is touched
    plc.clear_requests();
    let reply = h
        .router
        .dispatch(request("hm-0", "marking_request", json!({ "product_data": {} })))
        .await;
    assert_eq!(reply.payload["error_type"], "ValidationError");
    assert!(plc.requests().is_empty());

    plc.set_discrete_input(discrete_input::PRODUCT_PRESENT, false);
    let reply = h
        .router
        .dispatch(request("hm-2", "marking_request", json!({ "serial_number": "SN-8" })))
        .await;
    assert_eq!(reply.message_id, "error_hm-2");
    assert_eq!(reply.payload["error_type"], "HardwareError");
    assert_eq!(h.state.marks_completed(), 1);
    assert_eq!(h.state.error_count(), 1);
}
