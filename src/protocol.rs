use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

pub const RECORD_SEPARATOR: u8 = b'\n';
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

const RESPONSE_PREFIX: &str = "response_";
const ERROR_PREFIX: &str = "error_";
pub const ERROR_RESPONSE_TYPE: &str = "error_response";
/// Correlation id used when a malformed line carries no recoverable id.
pub const UNKNOWN_REQUEST_ID: &str = "unknown";

/// The envelope exchanged with production-floor clients, one JSON document per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub timestamp: String,
    pub message_type: String,
    pub payload: Value,
    /// Set by the server on inbound messages; clients leave it empty.
    #[serde(default)]
    pub client_id: String,
}

pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn response_id(request_id: &str) -> String {
    format!("{}{}", RESPONSE_PREFIX, request_id)
}

pub fn error_id(request_id: &str) -> String {
    format!("{}{}", ERROR_PREFIX, request_id)
}

impl Message {
    pub fn new(message_id: impl Into<String>, message_type: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: message_id.into(),
            timestamp: now_iso8601(),
            message_type: message_type.into(),
            payload,
            client_id: String::new(),
        }
    }

    /// Success reply correlated to `request_id`.
    pub fn response(request_id: &str, message_type: impl Into<String>, payload: Value) -> Self {
        Self::new(response_id(request_id), message_type, payload)
    }

    /// Standardized failure reply correlated to `request_id`.
    pub fn error(request_id: &str, error_type: &str, error: impl Into<String>) -> Self {
        Self::new(
            error_id(request_id),
            ERROR_RESPONSE_TYPE,
            json!({ "error": error.into(), "error_type": error_type }),
        )
    }

    pub fn is_error(&self) -> bool {
        self.message_type == ERROR_RESPONSE_TYPE
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("message is not valid UTF-8")]
    InvalidUtf8,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("field {field} must be {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },
    #[error("record contains an embedded newline")]
    EmbeddedNewline,
    #[error("message of {len} bytes exceeds the {max}-byte limit")]
    MessageTooLarge { len: usize, max: usize },
    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Serialize one record, newline-terminated.
pub fn encode(message: &Message) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(message).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    // serde_json escapes control characters, so the terminator is the only raw newline
    debug_assert!(!line.contains('\n'));
    line.push(RECORD_SEPARATOR as char);
    Ok(line)
}

/// Parse one record. A single trailing terminator (`\n` or `\r\n`) is accepted.
pub fn decode(line: &str) -> Result<Message, ProtocolError> {
    let record = line
        .strip_suffix('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .unwrap_or(line);
    if record.contains('\n') {
        return Err(ProtocolError::EmbeddedNewline);
    }

    let value: Value = serde_json::from_str(record).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    let Value::Object(mut fields) = value else {
        return Err(ProtocolError::InvalidField {
            field: "message",
            expected: "a JSON object",
        });
    };

    let message_id = take_string(&mut fields, "message_id")?;
    let timestamp = take_string(&mut fields, "timestamp")?;
    let message_type = take_string(&mut fields, "message_type")?;
    let payload = match fields.remove("payload") {
        None | Some(Value::Null) => return Err(ProtocolError::MissingField("payload")),
        Some(payload @ Value::Object(_)) => payload,
        Some(_) => {
            return Err(ProtocolError::InvalidField {
                field: "payload",
                expected: "a JSON object",
            })
        }
    };
    let client_id = match fields.remove("client_id") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(id)) => id,
        Some(_) => {
            return Err(ProtocolError::InvalidField {
                field: "client_id",
                expected: "a string",
            })
        }
    };

    Ok(Message {
        message_id,
        timestamp,
        message_type,
        payload,
        client_id,
    })
}

fn take_string(fields: &mut Map<String, Value>, field: &'static str) -> Result<String, ProtocolError> {
    match fields.remove(field) {
        None | Some(Value::Null) => Err(ProtocolError::MissingField(field)),
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(ProtocolError::InvalidField {
            field,
            expected: "a string",
        }),
    }
}

/// Best-effort id recovery from a line that failed to decode.
pub fn recover_message_id(line: &str) -> Option<String> {
    let value: Value = serde_json::from_str(line.trim_end()).ok()?;
    value.get("message_id")?.as_str().map(str::to_owned)
}

/// Splits a byte stream into newline-delimited records.
///
/// The buffer holds at most one partial record. A partial record that grows
/// past `max_len` is dropped along with the rest of its line.
#[derive(Debug)]
pub struct LineFramer {
    buffer: Vec<u8>,
    max_len: usize,
    discarding: bool,
}

impl LineFramer {
    pub fn new(max_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_len,
            discarding: false,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Next complete, non-blank line without its terminator.
    pub fn next_line(&mut self) -> Option<Result<String, ProtocolError>> {
        loop {
            let Some(end) = self.buffer.iter().position(|&b| b == RECORD_SEPARATOR) else {
                if !self.discarding && self.buffer.len() > self.max_len {
                    let len = self.buffer.len();
                    self.buffer.clear();
                    self.discarding = true;
                    return Some(Err(ProtocolError::MessageTooLarge { len, max: self.max_len }));
                }
                if self.discarding {
                    self.buffer.clear();
                }
                return None;
            };

            let raw: Vec<u8> = self.buffer.drain(..=end).collect();
            if self.discarding {
                self.discarding = false;
                continue;
            }
            if end > self.max_len {
                return Some(Err(ProtocolError::MessageTooLarge {
                    len: end,
                    max: self.max_len,
                }));
            }

            let text = match std::str::from_utf8(&raw[..end]) {
                Ok(text) => text.trim(),
                Err(_) => return Some(Err(ProtocolError::InvalidUtf8)),
            };
            if text.is_empty() {
                continue;
            }
            return Some(Ok(text.to_string()));
        }
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}
