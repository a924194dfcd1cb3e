use marking_gateway::config::{FieldbusConfig, GatewayConfig, MarkingConfig};
use marking_gateway::fieldbus::{ControllerBehavior, SimulatedController};
use marking_gateway::gateway::Health;
use marking_gateway::protocol::Message;
use marking_gateway::Gateway;
use serde_json::json;
use std::time::Duration;

fn gateway_config(plc_port: u16) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config.fieldbus = FieldbusConfig::modbus_tcp("127.0.0.1", plc_port);
    config.fieldbus.timeout_ms = 500;
    config.marking = MarkingConfig {
        poll_interval_ms: 10,
        completion_timeout_ms: 1000,
        cycle_hold_ms: 10,
    };
    config
}

/// A port with nothing listening on it.
fn vacant_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn mark(gateway: &Gateway, id: &str) -> Message {
    gateway
        .server()
        .router()
        .dispatch(Message::new(id, "marking_request", json!({ "serial_number": "SN-42" })))
        .await
}

#[tokio::test]
async fn test_falls_back_to_simulation_and_recovers() {
    let port = vacant_port();
    let gateway = Gateway::new(gateway_config(port));
    gateway.start().await.unwrap();

    assert!(!gateway.hardware_mode());
    let reply = mark(&gateway, "m-1").await;
    assert_eq!(reply.message_type, "marking_response");
    assert_eq!(reply.payload["hardware_execution"], false);

    let report = gateway.health_check().await;
    assert!(report.tcp_server);
    assert_eq!(report.fieldbus, Some(false));
    assert_eq!(report.overall, Health::Degraded);

    // Controller comes online; the next health check picks it up
    let _plc = SimulatedController::start(
        &format!("127.0.0.1:{}", port),
        ControllerBehavior::auto_complete(Duration::from_millis(20)),
    )
    .await
    .unwrap();
    let report = gateway.health_check().await;
    assert_eq!(report.fieldbus, Some(true));
    assert_eq!(report.overall, Health::Healthy);
    assert!(gateway.hardware_mode());

    let reply = mark(&gateway, "m-2").await;
    assert_eq!(reply.payload["hardware_execution"], true);
    assert_eq!(reply.payload["marks_completed"], 2);

    gateway.shutdown().await;
    assert!(!gateway.master().unwrap().is_connected());
}

#[tokio::test]
async fn test_disabled_fieldbus_reports_simulated() {
    let mut config = gateway_config(vacant_port());
    config.fieldbus.enabled = false;
    let gateway = Gateway::new(config);
    gateway.start().await.unwrap();

    assert!(gateway.master().is_none());
    let report = gateway.health_check().await;
    assert_eq!(report.fieldbus, None);
    assert_eq!(report.overall, Health::Healthy);

    let reply = gateway
        .server()
        .router()
        .dispatch(Message::new("s-1", "status_request", json!({})))
        .await;
    assert_eq!(reply.payload["connection"], "connected");
    assert_eq!(reply.payload["hardware_link"], "simulated");
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_connected_at_start_uses_hardware() {
    let plc = SimulatedController::start("127.0.0.1:0", ControllerBehavior::auto_complete(Duration::from_millis(20)))
        .await
        .unwrap();
    let gateway = Gateway::new(gateway_config(plc.local_addr().port()));
    gateway.start().await.unwrap();

    assert!(gateway.hardware_mode());
    let reply = mark(&gateway, "m-3").await;
    assert_eq!(reply.payload["hardware_execution"], true);
    assert!(!plc.coil_writes().is_empty());
    gateway.shutdown().await;
}
