//! Modbus-TCP-style request frames and response parsing.
//!
//! Request layout (big endian, 12 bytes):
//!
//! | bytes | field |
//! |-------|-------|
//! | 0..2  | transaction id |
//! | 2..4  | protocol id (always 0) |
//! | 4..6  | length of the remaining bytes (6) |
//! | 6     | unit id |
//! | 7     | function code |
//! | 8..10 | address |
//! | 10..12| quantity or coil value |

use super::LinkFault;
use static_assertions::const_assert_eq;

pub const REQUEST_FRAME_LEN: usize = 12;
/// MBAP header (7) plus function code.
pub const MIN_RESPONSE_LEN: usize = 9;
pub const DISCRETE_RESPONSE_LEN: usize = 10;
pub const REGISTER_RESPONSE_LEN: usize = 11;
pub const WRITE_ECHO_LEN: usize = 12;
pub const RESPONSE_BUFFER_SIZE: usize = 260;

pub const PROTOCOL_ID: u16 = 0;
pub const COIL_ON: u16 = 0xFF00;
pub const COIL_OFF: u16 = 0x0000;

/// Unit id plus the 5-byte PDU.
const LENGTH_FIELD: u16 = 6;
const EXCEPTION_FLAG: u8 = 0x80;

const_assert_eq!(REQUEST_FRAME_LEN, 6 + LENGTH_FIELD as usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    ReadDiscreteInputs = 0x02,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
}

impl FunctionCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x02 => Some(FunctionCode::ReadDiscreteInputs),
            0x04 => Some(FunctionCode::ReadInputRegisters),
            0x05 => Some(FunctionCode::WriteSingleCoil),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

impl core::fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FunctionCode::ReadDiscreteInputs => write!(f, "read discrete inputs"),
            FunctionCode::ReadInputRegisters => write!(f, "read input registers"),
            FunctionCode::WriteSingleCoil => write!(f, "write single coil"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
    pub function: FunctionCode,
    pub address: u16,
    pub value: u16,
}

impl Frame {
    pub fn new(transaction_id: u16, unit_id: u8, function: FunctionCode, address: u16, value: u16) -> Self {
        Self {
            transaction_id,
            protocol_id: PROTOCOL_ID,
            length: LENGTH_FIELD,
            unit_id,
            function,
            address,
            value,
        }
    }

    pub fn read_discrete(transaction_id: u16, unit_id: u8, address: u16) -> Self {
        Self::new(transaction_id, unit_id, FunctionCode::ReadDiscreteInputs, address, 1)
    }

    pub fn read_input_register(transaction_id: u16, unit_id: u8, address: u16) -> Self {
        Self::new(transaction_id, unit_id, FunctionCode::ReadInputRegisters, address, 1)
    }

    pub fn write_coil(transaction_id: u16, unit_id: u8, address: u16, on: bool) -> Self {
        let value = if on { COIL_ON } else { COIL_OFF };
        Self::new(transaction_id, unit_id, FunctionCode::WriteSingleCoil, address, value)
    }

    pub fn encode(&self) -> [u8; REQUEST_FRAME_LEN] {
        let mut bytes = [0u8; REQUEST_FRAME_LEN];
        bytes[0..2].copy_from_slice(&self.transaction_id.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.protocol_id.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.length.to_be_bytes());
        bytes[6] = self.unit_id;
        bytes[7] = self.function.code();
        bytes[8..10].copy_from_slice(&self.address.to_be_bytes());
        bytes[10..12].copy_from_slice(&self.value.to_be_bytes());
        bytes
    }

    /// Parse a request frame; used by the simulated controller.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < REQUEST_FRAME_LEN {
            return None;
        }
        let function = FunctionCode::from_u8(bytes[7])?;
        Some(Self {
            transaction_id: be16(bytes, 0),
            protocol_id: be16(bytes, 2),
            length: be16(bytes, 4),
            unit_id: bytes[6],
            function,
            address: be16(bytes, 8),
            value: be16(bytes, 10),
        })
    }
}

fn be16(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

fn check_header(response: &[u8], function: FunctionCode, min_len: usize) -> Result<(), LinkFault> {
    if response.len() < MIN_RESPONSE_LEN {
        return Err(LinkFault::MalformedResponse {
            function,
            reason: format!("{} bytes, below the {}-byte minimum", response.len(), MIN_RESPONSE_LEN),
        });
    }
    let code = response[7];
    if code == function.code() | EXCEPTION_FLAG {
        return Err(LinkFault::Exception {
            function,
            code: response[8],
        });
    }
    if code != function.code() {
        return Err(LinkFault::MalformedResponse {
            function,
            reason: format!("function code {:#04x} in response", code),
        });
    }
    if response.len() < min_len {
        return Err(LinkFault::MalformedResponse {
            function,
            reason: format!("{} bytes, expected at least {}", response.len(), min_len),
        });
    }
    Ok(())
}

pub fn parse_discrete_response(response: &[u8]) -> Result<bool, LinkFault> {
    check_header(response, FunctionCode::ReadDiscreteInputs, DISCRETE_RESPONSE_LEN)?;
    Ok(response[9] & 0x01 != 0)
}

pub fn parse_register_response(response: &[u8]) -> Result<u16, LinkFault> {
    check_header(response, FunctionCode::ReadInputRegisters, REGISTER_RESPONSE_LEN)?;
    Ok(be16(response, 9))
}

/// Write acknowledgement. Without `verify`, any non-empty response counts.
pub fn check_write_response(response: &[u8], request: &Frame, verify: bool) -> Result<(), LinkFault> {
    if response.is_empty() {
        return Err(LinkFault::MalformedResponse {
            function: request.function,
            reason: "empty response".to_string(),
        });
    }
    if !verify {
        return Ok(());
    }
    check_header(response, request.function, WRITE_ECHO_LEN)?;
    let address = be16(response, 8);
    let value = be16(response, 10);
    if address != request.address || value != request.value {
        return Err(LinkFault::MalformedResponse {
            function: request.function,
            reason: format!(
                "echo {}={:#06x} does not match request {}={:#06x}",
                address, value, request.address, request.value
            ),
        });
    }
    Ok(())
}

/// Build a response the way a controller would; the simulator uses these.
pub fn discrete_response(request: &Frame, value: bool) -> heapless::Vec<u8, RESPONSE_BUFFER_SIZE> {
    let mut out = response_header(request, 4);
    let _ = out.extend_from_slice(&[1, u8::from(value)]);
    out
}

pub fn register_response(request: &Frame, value: u16) -> heapless::Vec<u8, RESPONSE_BUFFER_SIZE> {
    let mut out = response_header(request, 5);
    let _ = out.push(2);
    let _ = out.extend_from_slice(&value.to_be_bytes());
    out
}

pub fn write_echo(request: &Frame) -> heapless::Vec<u8, RESPONSE_BUFFER_SIZE> {
    let mut out = heapless::Vec::new();
    let _ = out.extend_from_slice(&request.encode());
    out
}

pub fn exception_response(request: &Frame, code: u8) -> heapless::Vec<u8, RESPONSE_BUFFER_SIZE> {
    let mut out = heapless::Vec::new();
    let _ = out.extend_from_slice(&request.transaction_id.to_be_bytes());
    let _ = out.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
    let _ = out.extend_from_slice(&3u16.to_be_bytes());
    let _ = out.push(request.unit_id);
    let _ = out.push(request.function.code() | EXCEPTION_FLAG);
    let _ = out.push(code);
    out
}

fn response_header(request: &Frame, length: u16) -> heapless::Vec<u8, RESPONSE_BUFFER_SIZE> {
    let mut out = heapless::Vec::new();
    let _ = out.extend_from_slice(&request.transaction_id.to_be_bytes());
    let _ = out.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
    let _ = out.extend_from_slice(&length.to_be_bytes());
    let _ = out.push(request.unit_id);
    let _ = out.push(request.function.code());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_layout_matches_wire_format() {
        let frame = Frame::write_coil(0x0102, 0x11, 3, true);
        assert_eq!(
            frame.encode(),
            [0x01, 0x02, 0x00, 0x00, 0x00, 0x06, 0x11, 0x05, 0x00, 0x03, 0xFF, 0x00]
        );

        let frame = Frame::write_coil(7, 1, 2, false);
        assert_eq!(&frame.encode()[10..], &[0x00, 0x00]);

        let frame = Frame::read_input_register(9, 1, 1);
        assert_eq!(frame.encode()[7], 0x04);
        assert_eq!(&frame.encode()[10..], &[0x00, 0x01]);
    }

    #[test]
    fn decode_recovers_request() {
        let frame = Frame::read_discrete(42, 3, 2);
        assert_eq!(Frame::decode(&frame.encode()), Some(frame));
        assert_eq!(Frame::decode(&frame.encode()[..11]), None);
    }

    #[test]
    fn discrete_response_parses_low_bit() {
        let request = Frame::read_discrete(1, 1, 0);
        assert!(parse_discrete_response(&discrete_response(&request, true)).unwrap());
        assert!(!parse_discrete_response(&discrete_response(&request, false)).unwrap());
    }

    #[test]
    fn short_responses_are_malformed() {
        let request = Frame::read_discrete(1, 1, 0);
        let full = discrete_response(&request, true);

        for len in [0, 5, 8, 9] {
            assert!(matches!(
                parse_discrete_response(&full[..len]),
                Err(LinkFault::MalformedResponse { .. })
            ));
        }

        let request = Frame::read_input_register(1, 1, 0);
        let full = register_response(&request, 0x1234);
        assert_eq!(parse_register_response(&full).unwrap(), 0x1234);
        assert!(parse_register_response(&full[..10]).is_err());
    }

    #[test]
    fn exception_responses_are_reported() {
        let request = Frame::read_input_register(5, 1, 9);
        let response = exception_response(&request, 0x02);
        assert!(matches!(
            parse_register_response(&response),
            Err(LinkFault::Exception { code: 0x02, .. })
        ));
    }

    #[test]
    fn weak_write_check_accepts_any_bytes() {
        let request = Frame::write_coil(1, 1, 0, true);
        assert!(check_write_response(&[0x00], &request, false).is_ok());
        assert!(check_write_response(&[], &request, false).is_err());
    }

    #[test]
    fn verified_write_requires_matching_echo() {
        let request = Frame::write_coil(1, 1, 0, true);
        assert!(check_write_response(&write_echo(&request), &request, true).is_ok());

        let other = Frame::write_coil(1, 1, 0, false);
        assert!(check_write_response(&write_echo(&other), &request, true).is_err());
        assert!(check_write_response(&[0x00], &request, true).is_err());
    }
}
