use clap::{App, Arg};
use marking_gateway::fieldbus::{ControllerBehavior, SimulatedController};
use marking_gateway::io_points::discrete_input;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("plc-simulator")
        .version(env!("CARGO_PKG_VERSION"))
        .about("🔌 Simulated marking-station controller speaking Modbus TCP")
        .arg(
            Arg::with_name("bind")
                .short("b")
                .long("bind")
                .value_name("ADDR")
                .help("Address to listen on")
                .takes_value(true)
                .default_value("127.0.0.1:5020"),
        )
        .arg(
            Arg::with_name("complete-after")
                .long("complete-after")
                .value_name("MS")
                .help("Raise marking-complete this many milliseconds after marking-start")
                .takes_value(true)
                .default_value("750"),
        )
        .arg(
            Arg::with_name("no-product")
                .long("no-product")
                .help("Report no product at the marking head"),
        )
        .get_matches();

    let bind = matches.value_of("bind").unwrap_or("127.0.0.1:5020");
    let complete_after: u64 = matches.value_of("complete-after").unwrap_or("750").parse()?;

    println!("🔌 Marking Station Controller Simulator");
    println!("=======================================");

    let controller =
        SimulatedController::start(bind, ControllerBehavior::auto_complete(Duration::from_millis(complete_after))).await?;
    if matches.is_present("no-product") {
        controller.set_discrete_input(discrete_input::PRODUCT_PRESENT, false);
    }
    println!("Listening on {}", controller.local_addr());

    tokio::signal::ctrl_c().await?;
    info!("🛑 Simulator stopping after {} requests", controller.requests().len());
    controller.shutdown();
    Ok(())
}
