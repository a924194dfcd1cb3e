use super::frame::{self, Frame, RESPONSE_BUFFER_SIZE};
use super::{FieldbusError, LinkFault};
use crate::config::{FieldbusConfig, MarkingConfig, Transport};
use crate::io_points::{discrete_input, discrete_output, IoRegistry, Namespace};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

type ResponseBytes = heapless::Vec<u8, RESPONSE_BUFFER_SIZE>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connected,
}

impl LinkState {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connected => "connected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkingStage {
    Precheck,
    Start,
    AwaitComplete,
    Finish,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkingReport {
    pub requested_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub completion_polls: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    pub connection: LinkState,
    pub discrete_inputs: BTreeMap<String, Option<bool>>,
    pub analog_inputs: BTreeMap<String, Option<f64>>,
    pub last_update: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LinkStats {
    pub requests: u64,
    pub failures: u64,
    pub connects: u64,
}

enum Channel {
    Tcp(TcpStream),
    /// Serial lines are opened without verification and carry no frames.
    Serial,
}

/// The single link to the controller. Only reachable through the master's gate.
struct FieldbusLink {
    channel: Option<Channel>,
    next_transaction: u16,
}

impl FieldbusLink {
    fn state(&self) -> LinkState {
        if self.channel.is_some() {
            LinkState::Connected
        } else {
            LinkState::Disconnected
        }
    }

    fn next_transaction_id(&mut self) -> u16 {
        self.next_transaction = self.next_transaction.wrapping_add(1);
        self.next_transaction
    }

    fn drop_channel(&mut self) {
        if let Some(Channel::Tcp(stream)) = self.channel.take() {
            drop(stream);
        }
    }

    /// One request, one receive. No pipelining and no partial-frame reassembly.
    async fn exchange(&mut self, request: &Frame, limit: Duration) -> Result<ResponseBytes, LinkFault> {
        let stream = match self.channel.as_mut() {
            None => return Err(LinkFault::NotConnected),
            Some(Channel::Serial) => {
                return Err(LinkFault::Unsupported {
                    transport: "modbus_rtu",
                    operation: "exchange frames",
                })
            }
            Some(Channel::Tcp(stream)) => stream,
        };

        let bytes = request.encode();
        let mut buffer = [0u8; RESPONSE_BUFFER_SIZE];
        let outcome = tokio::time::timeout(limit, async {
            stream.write_all(&bytes).await?;
            stream.read(&mut buffer).await
        })
        .await;

        let result = match outcome {
            Ok(Ok(0)) => Err(LinkFault::Closed),
            Ok(Ok(n)) => Self::pair_response(request, &buffer[..n]),
            Ok(Err(e)) => Err(LinkFault::Io(e.to_string())),
            Err(_) => Err(LinkFault::Timeout {
                after_ms: limit.as_millis() as u64,
            }),
        };

        if let Err(fault) = &result {
            if fault.poisons_link() {
                warn!("Dropping fieldbus link after fault: {}", fault);
                self.drop_channel();
            }
        }
        result
    }

    fn pair_response(request: &Frame, response: &[u8]) -> Result<ResponseBytes, LinkFault> {
        if response.len() >= 2 {
            let transaction_id = u16::from_be_bytes([response[0], response[1]]);
            if transaction_id != request.transaction_id {
                return Err(LinkFault::MalformedResponse {
                    function: request.function,
                    reason: format!(
                        "transaction id {} does not answer request {}",
                        transaction_id, request.transaction_id
                    ),
                });
            }
        }
        // The buffer and the heapless capacity are the same size
        let mut out = ResponseBytes::new();
        let _ = out.extend_from_slice(response);
        Ok(out)
    }
}

/// Owner of the fieldbus link.
///
/// Every public operation acquires the link gate for its full duration, so
/// concurrent callers queue in FIFO order and frames from different operations
/// never interleave. The marking sequence holds the gate from precheck to the
/// end of the cycle-complete pulse.
pub struct FieldbusMaster {
    config: FieldbusConfig,
    marking: MarkingConfig,
    registry: Arc<IoRegistry>,
    link: Mutex<FieldbusLink>,
    connected: AtomicBool,
    requests: AtomicU64,
    failures: AtomicU64,
    connects: AtomicU64,
}

impl FieldbusMaster {
    pub fn new(config: FieldbusConfig, marking: MarkingConfig, registry: Arc<IoRegistry>) -> Self {
        Self {
            config,
            marking,
            registry,
            link: Mutex::new(FieldbusLink {
                channel: None,
                next_transaction: 0,
            }),
            connected: AtomicBool::new(false),
            requests: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            connects: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &FieldbusConfig {
        &self.config
    }

    pub fn registry(&self) -> &IoRegistry {
        &self.registry
    }

    /// Cached link state; does not wait for the gate.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn link_state(&self) -> LinkState {
        if self.is_connected() {
            LinkState::Connected
        } else {
            LinkState::Disconnected
        }
    }

    pub fn stats(&self) -> LinkStats {
        LinkStats {
            requests: self.requests.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
        }
    }

    async fn acquire(&self) -> Result<MutexGuard<'_, FieldbusLink>, FieldbusError> {
        match self.config.lock_timeout() {
            None => Ok(self.link.lock().await),
            Some(limit) => tokio::time::timeout(limit, self.link.lock())
                .await
                .map_err(|_| FieldbusError::Busy {
                    waited_ms: limit.as_millis() as u64,
                }),
        }
    }

    fn sync_state(&self, link: &FieldbusLink) {
        self.connected
            .store(link.state() == LinkState::Connected, Ordering::Release);
    }

    pub async fn connect(&self) -> Result<(), FieldbusError> {
        let mut link = self.acquire().await?;
        link.drop_channel();
        let channel = self.open_channel().await?;
        self.install(&mut link, channel);
        Ok(())
    }

    async fn open_channel(&self) -> Result<Channel, FieldbusError> {
        let channel = match &self.config.transport {
            Transport::ModbusTcp { host, port } => {
                let target = self.config.transport.to_string();
                let stream = tokio::time::timeout(self.config.timeout(), TcpStream::connect((host.as_str(), *port)))
                    .await
                    .map_err(|_| FieldbusError::Connection {
                        target: target.clone(),
                        reason: format!("timed out after {} ms", self.config.timeout_ms),
                    })?
                    .map_err(|e| FieldbusError::Connection {
                        target: target.clone(),
                        reason: e.to_string(),
                    })?;
                let _ = stream.set_nodelay(true);
                info!("Connected to controller via Modbus TCP: {}:{}", host, port);
                Channel::Tcp(stream)
            }
            Transport::ModbusRtu { device, baud_rate, .. } => {
                warn!(
                    "Modbus RTU link on {} @ {} baud marked connected without verification",
                    device, baud_rate
                );
                Channel::Serial
            }
        };
        Ok(channel)
    }

    fn install(&self, link: &mut FieldbusLink, channel: Channel) {
        link.channel = Some(channel);
        self.connects.fetch_add(1, Ordering::Relaxed);
        self.sync_state(link);
    }

    pub async fn disconnect(&self) {
        let mut link = self.link.lock().await;
        if link.channel.is_some() {
            link.drop_channel();
            info!("Fieldbus link closed");
        }
        self.sync_state(&link);
    }

    pub async fn read_discrete(&self, address: u16) -> Result<bool, FieldbusError> {
        self.registry.readable(Namespace::DiscreteInput, address)?;
        let mut link = self.acquire().await?;
        self.read_discrete_on(&mut link, address).await
    }

    pub async fn write_discrete(&self, address: u16, value: bool) -> Result<(), FieldbusError> {
        self.registry.writable(Namespace::DiscreteOutput, address)?;
        let mut link = self.acquire().await?;
        self.write_discrete_on(&mut link, address, value).await
    }

    pub async fn read_analog(&self, address: u16) -> Result<f64, FieldbusError> {
        self.registry.readable(Namespace::AnalogInput, address)?;
        let mut link = self.acquire().await?;
        self.read_analog_on(&mut link, address).await
    }

    async fn request(&self, link: &mut FieldbusLink, frame: &Frame) -> Result<ResponseBytes, LinkFault> {
        self.request_within(link, frame, self.config.timeout()).await
    }

    async fn request_within(
        &self,
        link: &mut FieldbusLink,
        frame: &Frame,
        limit: Duration,
    ) -> Result<ResponseBytes, LinkFault> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let result = link.exchange(frame, limit).await;
        if result.is_err() {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.sync_state(link);
        result
    }

    async fn read_discrete_on(&self, link: &mut FieldbusLink, address: u16) -> Result<bool, FieldbusError> {
        self.read_discrete_within(link, address, self.config.timeout()).await
    }

    async fn read_discrete_within(
        &self,
        link: &mut FieldbusLink,
        address: u16,
        limit: Duration,
    ) -> Result<bool, FieldbusError> {
        let frame = Frame::read_discrete(link.next_transaction_id(), self.config.unit_id, address);
        self.request_within(link, &frame, limit)
            .await
            .and_then(|response| frame::parse_discrete_response(&response))
            .map_err(|fault| FieldbusError::Read { address, fault })
    }

    async fn write_discrete_on(&self, link: &mut FieldbusLink, address: u16, value: bool) -> Result<(), FieldbusError> {
        let frame = Frame::write_coil(link.next_transaction_id(), self.config.unit_id, address, value);
        self.request(link, &frame)
            .await
            .and_then(|response| frame::check_write_response(&response, &frame, self.config.verify_writes))
            .map_err(|fault| FieldbusError::Write { address, fault })
    }

    async fn read_analog_on(&self, link: &mut FieldbusLink, address: u16) -> Result<f64, FieldbusError> {
        let frame = Frame::read_input_register(link.next_transaction_id(), self.config.unit_id, address);
        let raw = self
            .request(link, &frame)
            .await
            .and_then(|response| frame::parse_register_response(&response))
            .map_err(|fault| FieldbusError::Read { address, fault })?;
        Ok(self.config.scaling_for(address).apply(raw))
    }

    /// Drive one marking cycle: precheck, start, await completion, pulse cycle-complete.
    ///
    /// A failed precheck returns before any output is written. Once outputs
    /// have been driven, every failure path raises the error indicator.
    pub async fn run_marking_sequence(&self) -> Result<MarkingReport, FieldbusError> {
        let requested_at = Utc::now();
        let started = Instant::now();
        let mut link = self.acquire().await?;

        debug!("Marking stage: {:?}", MarkingStage::Precheck);
        if !self.read_discrete_on(&mut link, discrete_input::PRODUCT_PRESENT).await? {
            warn!("No product detected for marking");
            return Err(FieldbusError::PrecheckFailed {
                signal: "product present",
            });
        }
        if !self.read_discrete_on(&mut link, discrete_input::SYSTEM_READY).await? {
            warn!("System not ready for marking");
            return Err(FieldbusError::PrecheckFailed { signal: "system ready" });
        }

        match self.drive_cycle(&mut link).await {
            Ok(completion_polls) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                info!("Marking sequence completed in {} ms", elapsed_ms);
                Ok(MarkingReport {
                    requested_at,
                    elapsed_ms,
                    completion_polls,
                })
            }
            Err(e) => {
                error!("Marking sequence failed: {}", e);
                if link.channel.is_none() {
                    // The failed exchange dropped the link; reopen it to signal the error
                    match self.open_channel().await {
                        Ok(channel) => self.install(&mut link, channel),
                        Err(reopen_err) => warn!("Cannot reopen link to signal error: {}", reopen_err),
                    }
                }
                if let Err(signal_err) = self
                    .write_discrete_on(&mut link, discrete_output::ERROR_INDICATOR, true)
                    .await
                {
                    error!("Failed to raise error indicator: {}", signal_err);
                }
                Err(e)
            }
        }
    }

    async fn drive_cycle(&self, link: &mut FieldbusLink) -> Result<u32, FieldbusError> {
        debug!("Marking stage: {:?}", MarkingStage::Start);
        self.write_discrete_on(link, discrete_output::MARKING_START, true).await?;
        self.write_discrete_on(link, discrete_output::STATUS_LED, true).await?;

        debug!("Marking stage: {:?}", MarkingStage::AwaitComplete);
        let deadline = Instant::now() + self.marking.completion_timeout();
        let expired = || FieldbusError::SequenceTimeout {
            after_ms: self.marking.completion_timeout_ms,
        };
        let mut polls = 0u32;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if polls > 0 && remaining.is_zero() {
                return Err(expired());
            }
            polls += 1;
            // No single read may carry the sequence past its deadline
            let limit = remaining.min(self.config.timeout());
            match self
                .read_discrete_within(link, discrete_input::MARKING_COMPLETE, limit)
                .await
            {
                Ok(true) => break,
                Ok(false) => {}
                Err(FieldbusError::Read {
                    fault: LinkFault::Timeout { .. },
                    ..
                }) if limit < self.config.timeout() => return Err(expired()),
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                return Err(expired());
            }
            tokio::time::sleep(self.marking.poll_interval()).await;
        }

        debug!("Marking stage: {:?}", MarkingStage::Finish);
        self.write_discrete_on(link, discrete_output::CYCLE_COMPLETE, true).await?;
        tokio::time::sleep(self.marking.cycle_hold()).await;
        self.write_discrete_on(link, discrete_output::CYCLE_COMPLETE, false).await?;
        Ok(polls)
    }

    /// Snapshot every readable point by description. Individual read failures
    /// are recorded as `None` instead of failing the snapshot.
    pub async fn system_status(&self) -> SystemStatus {
        let mut status = SystemStatus {
            connection: self.link_state(),
            discrete_inputs: BTreeMap::new(),
            analog_inputs: BTreeMap::new(),
            last_update: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        if !self.is_connected() {
            return status;
        }

        let mut link = match self.acquire().await {
            Ok(link) => Some(link),
            Err(e) => {
                warn!("Status snapshot without hardware values: {}", e);
                None
            }
        };

        for point in self.registry.points(Namespace::DiscreteInput) {
            let value = match link.as_mut() {
                Some(link) => self.read_discrete_on(link, point.address).await.ok(),
                None => None,
            };
            status.discrete_inputs.insert(point.description.clone(), value);
        }
        for point in self.registry.points(Namespace::AnalogInput) {
            let value = match link.as_mut() {
                Some(link) => self.read_analog_on(link, point.address).await.ok(),
                None => None,
            };
            status.analog_inputs.insert(point.description.clone(), value);
        }

        status.connection = self.link_state();
        status
    }
}
