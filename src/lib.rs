//! # Industrial Marking Gateway
//!
//! Connects production-floor clients to a marking station. Clients speak
//! newline-delimited JSON over TCP; the station's controller is driven over a
//! Modbus-TCP-style fieldbus.
//!
//! ## Features
//!
//! - **Message server**: per-client framing, ordered request/response, periodic status broadcasts
//! - **Hot-swappable dispatch**: handlers can be replaced while the server runs
//! - **Fieldbus master**: serialized link access and the full marking cycle with error signalling
//! - **Simulation fallback**: marking keeps answering while the controller is unreachable
//! - **Controller simulator**: a wire-compatible stand-in for bench work and tests
//!
//! ## Quick Start
//!
//! ```no_run
//! use marking_gateway::{Gateway, GatewayConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let gateway = Gateway::new(GatewayConfig::default());
//! let addr = gateway.start().await?;
//! println!("listening on {}", addr);
//! gateway.stopped().await;
//! gateway.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`protocol`] - Message envelope, line framing and correlation ids
//! - [`connection`] - Client registry, reader tasks, sends and broadcasts
//! - [`dispatch`] - Message-type routing and built-in handlers
//! - [`server`] - Server lifecycle
//! - [`fieldbus`] - Frame codec, master and simulated controller
//! - [`io_points`] - The station's I/O map
//! - [`gateway`] - Wiring, simulation fallback and health checks

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod fieldbus;
pub mod gateway;
pub mod io_points;
pub mod protocol;
pub mod server;
pub mod state;

// Re-export main public types for convenience
pub use config::GatewayConfig;
pub use dispatch::{HandlerContext, MessageHandler, Reply, Router};
pub use fieldbus::{FieldbusMaster, SimulatedController};
pub use gateway::Gateway;
pub use io_points::IoRegistry;
pub use protocol::Message;
pub use server::MarkingServer;
