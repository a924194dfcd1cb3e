use clap::{App, Arg};
use marking_gateway::config::{FieldbusConfig, GatewayConfig};
use marking_gateway::Gateway;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("marking-gateway")
        .version(env!("CARGO_PKG_VERSION"))
        .about("🏭 Industrial marking gateway - production-floor TCP server and fieldbus master")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("YAML configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("host")
                .long("host")
                .value_name("HOST")
                .help("Address to accept client connections on")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Port to accept client connections on")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("plc")
                .long("plc")
                .value_name("HOST:PORT")
                .help("Controller address for Modbus TCP")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("simulate")
                .long("simulate")
                .help("Run without a fieldbus link; marking is simulated"),
        )
        .get_matches();

    let mut config = match matches.value_of("config") {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(host) = matches.value_of("host") {
        config.server.host = host.to_string();
    }
    if let Some(port) = matches.value_of("port") {
        config.server.port = port.parse()?;
    }
    if let Some(plc) = matches.value_of("plc") {
        let (host, port) = plc.rsplit_once(':').ok_or("--plc expects HOST:PORT")?;
        config.fieldbus.transport = FieldbusConfig::modbus_tcp(host, port.parse()?).transport;
    }
    if matches.is_present("simulate") {
        config.fieldbus.enabled = false;
    }
    config.validate()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    println!("🏭 Industrial Marking Gateway");
    println!("=============================");
    if config.fieldbus.enabled {
        println!("Fieldbus: {}", config.fieldbus.transport);
    } else {
        println!("Fieldbus: disabled (simulation)");
    }

    let gateway = Arc::new(Gateway::new(config));
    let addr = match gateway.start().await {
        Ok(addr) => addr,
        Err(e) => {
            error!("❌ Gateway failed to start: {}", e);
            return Err(e.into());
        }
    };
    println!("Listening on {}", addr);

    let monitor = {
        let gateway = Arc::clone(&gateway);
        let shutdown = gateway.shutdown_token();
        tokio::spawn(async move { gateway.run_health_monitor(shutdown).await })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("🛑 Interrupt received"),
        _ = gateway.stopped() => info!("🛑 Shutdown requested by client"),
    }

    gateway.shutdown().await;
    let _ = monitor.await;
    info!("✅ Gateway shutdown complete");
    Ok(())
}
