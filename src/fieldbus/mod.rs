pub mod frame;
pub mod master;
pub mod simulator;

pub use frame::{Frame, FunctionCode};
pub use master::{FieldbusMaster, LinkState, LinkStats, MarkingReport, MarkingStage, SystemStatus};
pub use simulator::{ControllerBehavior, RequestRecord, SimulatedController};

use crate::io_points::RegistryError;
use thiserror::Error;

/// Failure of a single request/response exchange on the link.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkFault {
    #[error("link is not connected")]
    NotConnected,
    #[error("{transport} transport cannot {operation}")]
    Unsupported {
        transport: &'static str,
        operation: &'static str,
    },
    #[error("i/o error: {0}")]
    Io(String),
    #[error("controller closed the connection")]
    Closed,
    #[error("no response within {after_ms} ms")]
    Timeout { after_ms: u64 },
    #[error("malformed {function} response: {reason}")]
    MalformedResponse { function: FunctionCode, reason: String },
    #[error("controller rejected {function} with exception code {code:#04x}")]
    Exception { function: FunctionCode, code: u8 },
}

impl LinkFault {
    /// Faults after which request/response pairing can no longer be trusted.
    pub fn poisons_link(&self) -> bool {
        matches!(self, LinkFault::Io(_) | LinkFault::Closed | LinkFault::Timeout { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FieldbusError {
    #[error("fieldbus connection to {target} failed: {reason}")]
    Connection { target: String, reason: String },
    #[error("read of address {address} failed: {fault}")]
    Read {
        address: u16,
        #[source]
        fault: LinkFault,
    },
    #[error("write of address {address} failed: {fault}")]
    Write {
        address: u16,
        #[source]
        fault: LinkFault,
    },
    #[error(transparent)]
    UnknownPoint(#[from] RegistryError),
    #[error("fieldbus link busy for {waited_ms} ms")]
    Busy { waited_ms: u64 },
    #[error("marking precheck failed: {signal} is not active")]
    PrecheckFailed { signal: &'static str },
    #[error("marking did not complete within {after_ms} ms")]
    SequenceTimeout { after_ms: u64 },
}
