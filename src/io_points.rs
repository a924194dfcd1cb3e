use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Discrete inputs wired to the marking station.
pub mod discrete_input {
    pub const PRODUCT_PRESENT: u16 = 0;
    pub const SYSTEM_READY: u16 = 1;
    pub const EMERGENCY_STOP: u16 = 2;
    pub const MARKING_COMPLETE: u16 = 3;
}

/// Discrete outputs (coils) driven by the gateway.
pub mod discrete_output {
    pub const MARKING_START: u16 = 0;
    pub const STATUS_LED: u16 = 1;
    pub const ERROR_INDICATOR: u16 = 2;
    pub const CYCLE_COMPLETE: u16 = 3;
}

pub mod analog_input {
    pub const LINE_SPEED: u16 = 0;
    pub const PRINT_QUALITY: u16 = 1;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    DiscreteInput,
    DiscreteOutput,
    AnalogInput,
}

impl core::fmt::Display for Namespace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Namespace::DiscreteInput => write!(f, "discrete input"),
            Namespace::DiscreteOutput => write!(f, "discrete output"),
            Namespace::AnalogInput => write!(f, "analog input"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Boolean,
    Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub fn can_read(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoPoint {
    pub address: u16,
    pub description: String,
    pub kind: DataKind,
    pub access: Access,
}

impl IoPoint {
    pub fn new(address: u16, description: &str, kind: DataKind, access: Access) -> Self {
        Self {
            address,
            description: description.to_string(),
            kind,
            access,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("duplicate {namespace} address {address}")]
    DuplicateAddress { namespace: Namespace, address: u16 },
    #[error("no {namespace} registered at address {address}")]
    UnknownAddress { namespace: Namespace, address: u16 },
    #[error("{namespace} {address} does not permit {operation}")]
    AccessDenied {
        namespace: Namespace,
        address: u16,
        operation: &'static str,
    },
}

/// Immutable catalogue of the station's I/O, one address space per namespace.
///
/// Points are kept sorted by address so snapshots come out in wiring order.
#[derive(Debug, Clone)]
pub struct IoRegistry {
    discrete_inputs: Vec<IoPoint>,
    discrete_outputs: Vec<IoPoint>,
    analog_inputs: Vec<IoPoint>,
}

impl IoRegistry {
    pub fn new(
        discrete_inputs: Vec<IoPoint>,
        discrete_outputs: Vec<IoPoint>,
        analog_inputs: Vec<IoPoint>,
    ) -> Result<Self, RegistryError> {
        Ok(Self {
            discrete_inputs: Self::sorted_unique(Namespace::DiscreteInput, discrete_inputs)?,
            discrete_outputs: Self::sorted_unique(Namespace::DiscreteOutput, discrete_outputs)?,
            analog_inputs: Self::sorted_unique(Namespace::AnalogInput, analog_inputs)?,
        })
    }

    /// The marking station's standard wiring.
    pub fn marking_station() -> Self {
        use Access::{Read, Write};
        use DataKind::{Boolean, Float};

        Self {
            discrete_inputs: vec![
                IoPoint::new(discrete_input::PRODUCT_PRESENT, "Product Present Sensor", Boolean, Read),
                IoPoint::new(discrete_input::SYSTEM_READY, "System Ready", Boolean, Read),
                IoPoint::new(discrete_input::EMERGENCY_STOP, "Emergency Stop", Boolean, Read),
                IoPoint::new(discrete_input::MARKING_COMPLETE, "Marking Complete", Boolean, Read),
            ],
            discrete_outputs: vec![
                IoPoint::new(discrete_output::MARKING_START, "Marking Start", Boolean, Write),
                IoPoint::new(discrete_output::STATUS_LED, "System Status LED", Boolean, Write),
                IoPoint::new(discrete_output::ERROR_INDICATOR, "Error Indicator", Boolean, Write),
                IoPoint::new(discrete_output::CYCLE_COMPLETE, "Cycle Complete", Boolean, Write),
            ],
            analog_inputs: vec![
                IoPoint::new(analog_input::LINE_SPEED, "Line Speed", Float, Read),
                IoPoint::new(analog_input::PRINT_QUALITY, "Print Quality Sensor", Float, Read),
            ],
        }
    }

    fn sorted_unique(namespace: Namespace, mut points: Vec<IoPoint>) -> Result<Vec<IoPoint>, RegistryError> {
        points.sort_by_key(|p| p.address);
        if let Some(pair) = points.windows(2).find(|w| w[0].address == w[1].address) {
            return Err(RegistryError::DuplicateAddress {
                namespace,
                address: pair[0].address,
            });
        }
        Ok(points)
    }

    pub fn points(&self, namespace: Namespace) -> &[IoPoint] {
        match namespace {
            Namespace::DiscreteInput => &self.discrete_inputs,
            Namespace::DiscreteOutput => &self.discrete_outputs,
            Namespace::AnalogInput => &self.analog_inputs,
        }
    }

    pub fn lookup(&self, namespace: Namespace, address: u16) -> Result<&IoPoint, RegistryError> {
        self.points(namespace)
            .binary_search_by_key(&address, |p| p.address)
            .map(|index| &self.points(namespace)[index])
            .map_err(|_| RegistryError::UnknownAddress { namespace, address })
    }

    pub fn readable(&self, namespace: Namespace, address: u16) -> Result<&IoPoint, RegistryError> {
        let point = self.lookup(namespace, address)?;
        if !point.access.can_read() {
            return Err(RegistryError::AccessDenied {
                namespace,
                address,
                operation: "read",
            });
        }
        Ok(point)
    }

    pub fn writable(&self, namespace: Namespace, address: u16) -> Result<&IoPoint, RegistryError> {
        let point = self.lookup(namespace, address)?;
        if !point.access.can_write() {
            return Err(RegistryError::AccessDenied {
                namespace,
                address,
                operation: "write",
            });
        }
        Ok(point)
    }
}

impl Default for IoRegistry {
    fn default() -> Self {
        Self::marking_station()
    }
}
