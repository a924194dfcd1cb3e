//! Gateway configuration.
//!
//! Every section falls back to the station defaults, so a YAML file only needs
//! to name what differs:
//!
//! ```yaml
//! server:
//!   port: 9000
//! fieldbus:
//!   transport:
//!     protocol: modbus_tcp
//!     host: 10.0.0.20
//!   analog_scaling:
//!     0: { scale: 0.1, offset: 0.0 }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub fieldbus: FieldbusConfig,
    pub marking: MarkingConfig,
    pub health: HealthConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_message_bytes: usize,
    pub write_timeout_ms: u64,
    pub broadcast_interval_secs: u64,
    pub shutdown_delay_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_message_bytes: 64 * 1024,
            write_timeout_ms: 5000,
            broadcast_interval_secs: 30,
            shutdown_delay_ms: 1000,
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_secs(self.broadcast_interval_secs)
    }

    pub fn shutdown_delay(&self) -> Duration {
        Duration::from_millis(self.shutdown_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum Transport {
    ModbusTcp {
        host: String,
        #[serde(default = "default_modbus_port")]
        port: u16,
    },
    ModbusRtu {
        device: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default = "default_parity")]
        parity: String,
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
    },
}

fn default_modbus_port() -> u16 {
    502
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_parity() -> String {
    "none".to_string()
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

impl Default for Transport {
    fn default() -> Self {
        Transport::ModbusTcp {
            host: "192.168.1.100".to_string(),
            port: default_modbus_port(),
        }
    }
}

impl core::fmt::Display for Transport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Transport::ModbusTcp { host, port } => write!(f, "modbus_tcp://{}:{}", host, port),
            Transport::ModbusRtu { device, baud_rate, .. } => {
                write!(f, "modbus_rtu://{}@{}", device, baud_rate)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalogScaling {
    pub scale: f64,
    pub offset: f64,
}

impl Default for AnalogScaling {
    fn default() -> Self {
        Self { scale: 1.0, offset: 0.0 }
    }
}

impl AnalogScaling {
    pub fn apply(&self, raw: u16) -> f64 {
        f64::from(raw) * self.scale + self.offset
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldbusConfig {
    pub enabled: bool,
    pub transport: Transport,
    pub unit_id: u8,
    pub timeout_ms: u64,
    /// Upper bound on queueing for the exclusive link; `None` waits indefinitely.
    pub lock_timeout_ms: Option<u64>,
    pub verify_writes: bool,
    pub analog_scaling: BTreeMap<u16, AnalogScaling>,
}

impl Default for FieldbusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            transport: Transport::default(),
            unit_id: 1,
            timeout_ms: 5000,
            lock_timeout_ms: None,
            verify_writes: false,
            analog_scaling: BTreeMap::new(),
        }
    }
}

impl FieldbusConfig {
    pub fn modbus_tcp(host: &str, port: u16) -> Self {
        Self {
            transport: Transport::ModbusTcp {
                host: host.to_string(),
                port,
            },
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }

    pub fn scaling_for(&self, address: u16) -> AnalogScaling {
        self.analog_scaling.get(&address).copied().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkingConfig {
    pub poll_interval_ms: u64,
    pub completion_timeout_ms: u64,
    pub cycle_hold_ms: u64,
}

impl Default for MarkingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            completion_timeout_ms: 10_000,
            cycle_hold_ms: 500,
        }
    }
}

impl MarkingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }

    pub fn cycle_hold(&self) -> Duration {
        Duration::from_millis(self.cycle_hold_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_secs: u64,
    pub reconnect: bool,
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            reconnect: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_message_bytes == 0 {
            return Err(ConfigError::Invalid("server.max_message_bytes must be positive".into()));
        }
        if self.server.broadcast_interval_secs == 0 {
            return Err(ConfigError::Invalid("server.broadcast_interval_secs must be positive".into()));
        }
        if self.fieldbus.timeout_ms == 0 {
            return Err(ConfigError::Invalid("fieldbus.timeout_ms must be positive".into()));
        }
        if self.marking.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("marking.poll_interval_ms must be positive".into()));
        }
        if self.marking.completion_timeout_ms < self.marking.poll_interval_ms {
            return Err(ConfigError::Invalid(
                "marking.completion_timeout_ms must cover at least one poll interval".into(),
            ));
        }
        if self.health.interval_secs == 0 {
            return Err(ConfigError::Invalid("health.interval_secs must be positive".into()));
        }
        for (address, scaling) in &self.fieldbus.analog_scaling {
            if !scaling.scale.is_finite() || !scaling.offset.is_finite() {
                return Err(ConfigError::Invalid(format!(
                    "fieldbus.analog_scaling[{}] must be finite",
                    address
                )));
            }
        }
        Ok(())
    }
}
