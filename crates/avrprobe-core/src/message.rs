//! Captured message types.

use std::fmt;
use std::time::Instant;

use serde_json::Value;

/// A decoded payload from either transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// One line of the serial protocol, without its terminator.
    Line(String),
    /// One JSON object from the socket protocol.
    Json(Value),
}

impl Payload {
    /// The line text, if this is a line payload.
    pub fn as_line(&self) -> Option<&str> {
        match self {
            Payload::Line(line) => Some(line),
            Payload::Json(_) => None,
        }
    }

    /// The JSON value, if this is a structured payload.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Line(_) => None,
        }
    }

    /// Look up a top-level field of a structured payload.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.as_json().and_then(|v| v.get(name))
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Line(line) => f.write_str(line),
            Payload::Json(value) => write!(f, "{value}"),
        }
    }
}

/// A message as captured from a transport. Immutable once created.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Capture index within its stream, starting at 0.
    pub seq: usize,
    /// The decoded payload.
    pub payload: Payload,
    /// When the capture loop decoded the message.
    pub received_at: Instant,
}

impl RawMessage {
    pub fn new(seq: usize, payload: Payload) -> Self {
        Self {
            seq,
            payload,
            received_at: Instant::now(),
        }
    }
}

impl fmt::Display for RawMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.seq, self.payload)
    }
}
