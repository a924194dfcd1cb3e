//! A Modbus-TCP-style slave that behaves like the marking station's controller.
//!
//! The master only ever talks to it through the wire format, which makes it
//! usable both as a bench stand-in (`plc-simulator`) and in integration tests.

use super::frame::{self, Frame, FunctionCode, COIL_ON, REQUEST_FRAME_LEN, RESPONSE_BUFFER_SIZE};
use crate::io_points::{analog_input, discrete_input, discrete_output};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const LOG_CAPACITY: usize = 1024;
const ILLEGAL_DATA_ADDRESS: u8 = 0x02;

#[derive(Debug, Clone, Default)]
pub struct ControllerBehavior {
    /// Raise marking-complete this long after marking-start is switched on.
    pub auto_complete_after: Option<Duration>,
    pub response_delay: Duration,
    /// Cut every response down to this many bytes.
    pub truncate_responses: Option<usize>,
    /// Swallow requests without answering.
    pub silent: bool,
}

impl ControllerBehavior {
    pub fn auto_complete(after: Duration) -> Self {
        Self {
            auto_complete_after: Some(after),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestRecord {
    pub connection: u32,
    pub transaction_id: u16,
    pub function: FunctionCode,
    pub address: u16,
    pub value: u16,
}

impl RequestRecord {
    pub fn is_coil_write(&self, address: u16, on: bool) -> bool {
        self.function == FunctionCode::WriteSingleCoil
            && self.address == address
            && (self.value == COIL_ON) == on
    }
}

struct ControllerState {
    discrete_inputs: HashMap<u16, bool>,
    coils: HashMap<u16, bool>,
    input_registers: HashMap<u16, u16>,
    log: heapless::HistoryBuffer<RequestRecord, LOG_CAPACITY>,
    behavior: ControllerBehavior,
}

impl ControllerState {
    fn new(behavior: ControllerBehavior) -> Self {
        let discrete_inputs = HashMap::from([
            (discrete_input::PRODUCT_PRESENT, true),
            (discrete_input::SYSTEM_READY, true),
            (discrete_input::EMERGENCY_STOP, false),
            (discrete_input::MARKING_COMPLETE, false),
        ]);
        let coils = HashMap::from([
            (discrete_output::MARKING_START, false),
            (discrete_output::STATUS_LED, false),
            (discrete_output::ERROR_INDICATOR, false),
            (discrete_output::CYCLE_COMPLETE, false),
        ]);
        let input_registers = HashMap::from([(analog_input::LINE_SPEED, 1200), (analog_input::PRINT_QUALITY, 95)]);

        Self {
            discrete_inputs,
            coils,
            input_registers,
            log: heapless::HistoryBuffer::new(),
            behavior,
        }
    }
}

type SharedState = Arc<Mutex<ControllerState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, ControllerState> {
    state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

pub struct SimulatedController {
    local_addr: SocketAddr,
    state: SharedState,
    shutdown: CancellationToken,
}

impl SimulatedController {
    pub async fn start(bind: &str, behavior: ControllerBehavior) -> std::io::Result<Self> {
        let listener = TcpListener::bind(bind).await?;
        let local_addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(ControllerState::new(behavior)));
        let shutdown = CancellationToken::new();

        tokio::spawn(accept_loop(listener, Arc::clone(&state), shutdown.clone()));
        info!("Simulated controller listening on {}", local_addr);

        Ok(Self {
            local_addr,
            state,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn set_discrete_input(&self, address: u16, value: bool) {
        lock(&self.state).discrete_inputs.insert(address, value);
    }

    pub fn set_input_register(&self, address: u16, value: u16) {
        lock(&self.state).input_registers.insert(address, value);
    }

    pub fn set_behavior(&self, behavior: ControllerBehavior) {
        lock(&self.state).behavior = behavior;
    }

    pub fn coil(&self, address: u16) -> bool {
        lock(&self.state).coils.get(&address).copied().unwrap_or(false)
    }

    /// Requests in arrival order (the most recent `LOG_CAPACITY`).
    pub fn requests(&self) -> Vec<RequestRecord> {
        lock(&self.state).log.oldest_ordered().copied().collect()
    }

    pub fn clear_requests(&self) {
        lock(&self.state).log = heapless::HistoryBuffer::new();
    }

    pub fn coil_writes(&self) -> Vec<RequestRecord> {
        self.requests()
            .into_iter()
            .filter(|r| r.function == FunctionCode::WriteSingleCoil)
            .collect()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for SimulatedController {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(listener: TcpListener, state: SharedState, shutdown: CancellationToken) {
    let mut next_connection = 0u32;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    next_connection += 1;
                    debug!("Controller accepted master {} as #{}", peer, next_connection);
                    tokio::spawn(serve_master(
                        stream,
                        next_connection,
                        Arc::clone(&state),
                        shutdown.child_token(),
                    ));
                }
                Err(e) => warn!("Controller accept failed: {}", e),
            },
        }
    }
}

async fn serve_master(mut stream: TcpStream, connection: u32, state: SharedState, shutdown: CancellationToken) {
    let mut request = [0u8; REQUEST_FRAME_LEN];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            read = stream.read_exact(&mut request) => {
                if read.is_err() {
                    break;
                }
            }
        }

        let Some(frame) = Frame::decode(&request) else {
            warn!("Controller received an unsupported request: {:02x?}", request);
            continue;
        };

        let (response, behavior) = answer(&state, connection, &frame);
        if behavior.silent {
            continue;
        }
        if !behavior.response_delay.is_zero() {
            tokio::time::sleep(behavior.response_delay).await;
        }
        let len = behavior
            .truncate_responses
            .map_or(response.len(), |limit| limit.min(response.len()));
        if stream.write_all(&response[..len]).await.is_err() {
            break;
        }
    }
}

fn answer(
    state: &SharedState,
    connection: u32,
    frame: &Frame,
) -> (heapless::Vec<u8, RESPONSE_BUFFER_SIZE>, ControllerBehavior) {
    let mut guard = lock(state);
    guard.log.write(RequestRecord {
        connection,
        transaction_id: frame.transaction_id,
        function: frame.function,
        address: frame.address,
        value: frame.value,
    });

    let response = match frame.function {
        FunctionCode::ReadDiscreteInputs => match guard.discrete_inputs.get(&frame.address) {
            Some(value) => frame::discrete_response(frame, *value),
            None => frame::exception_response(frame, ILLEGAL_DATA_ADDRESS),
        },
        FunctionCode::ReadInputRegisters => match guard.input_registers.get(&frame.address) {
            Some(value) => frame::register_response(frame, *value),
            None => frame::exception_response(frame, ILLEGAL_DATA_ADDRESS),
        },
        FunctionCode::WriteSingleCoil => {
            let on = frame.value == COIL_ON;
            guard.coils.insert(frame.address, on);
            apply_coil_side_effects(state, &mut guard, frame.address, on);
            frame::write_echo(frame)
        }
    };
    (response, guard.behavior.clone())
}

/// Model the station's reaction to the gateway's outputs.
fn apply_coil_side_effects(state: &SharedState, guard: &mut ControllerState, address: u16, on: bool) {
    match (address, on) {
        (discrete_output::MARKING_START, true) => {
            if let Some(after) = guard.behavior.auto_complete_after {
                let state = Arc::clone(state);
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    lock(&state)
                        .discrete_inputs
                        .insert(discrete_input::MARKING_COMPLETE, true);
                });
            }
        }
        (discrete_output::CYCLE_COMPLETE, true) => {
            // The station acknowledges the cycle and re-arms for the next product
            guard.coils.insert(discrete_output::MARKING_START, false);
            guard.discrete_inputs.insert(discrete_input::MARKING_COMPLETE, false);
        }
        _ => {}
    }
}
