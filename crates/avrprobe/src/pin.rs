//! Pin values and the "current state" projection over structured traffic.
//!
//! A device reports pin changes as structured messages such as
//! `{"type": "pinState", "pin": "D12", "state": true}`. The current state of
//! a pin is the value carried by the most recently captured such message;
//! earlier values are history, not state.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::{Value, json};

use avrprobe_capture::Snapshot;
use avrprobe_core::error::Error;
use avrprobe_core::message::RawMessage;

/// A digital level or an analog reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinValue {
    Digital(bool),
    Analog(i64),
}

impl PinValue {
    /// JSON form used in `pinState` requests.
    pub fn to_json(self) -> Value {
        match self {
            PinValue::Digital(level) => json!(level),
            PinValue::Analog(value) => json!(value),
        }
    }

    /// Whether a reported state equals this value.
    ///
    /// Digital levels and the integers 0/1 compare equal, so a board that
    /// reports `1` for a high pin satisfies `Digital(true)`.
    pub fn matches(self, state: &Value) -> bool {
        let as_int = match state {
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Number(n) => n.as_i64(),
            _ => None,
        };
        match self {
            PinValue::Digital(level) => as_int == Some(i64::from(level)),
            PinValue::Analog(value) => as_int == Some(value),
        }
    }
}

impl FromStr for PinValue {
    type Err = Error;

    /// Parses `true/false`, `on/off`, `high/low` (any case) or an integer.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "true" | "on" | "high" => Ok(PinValue::Digital(true)),
            "false" | "off" | "low" => Ok(PinValue::Digital(false)),
            other => other
                .parse()
                .map(PinValue::Analog)
                .map_err(|_| Error::InvalidRequest(format!("not a pin value: {s}"))),
        }
    }
}

impl fmt::Display for PinValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinValue::Digital(true) => f.write_str("high"),
            PinValue::Digital(false) => f.write_str("low"),
            PinValue::Analog(value) => write!(f, "{value}"),
        }
    }
}

/// Which structured messages carry state, and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateView {
    /// Required value of the `type` field; `None` accepts any message.
    pub message_type: Option<String>,
    /// Field naming the key (e.g. `pin`).
    pub key_field: String,
    /// Field carrying the value (e.g. `state`).
    pub value_field: String,
}

impl Default for StateView {
    fn default() -> Self {
        Self::pin_state()
    }
}

impl StateView {
    pub fn new(message_type: Option<&str>, key_field: &str, value_field: &str) -> Self {
        Self {
            message_type: message_type.map(str::to_string),
            key_field: key_field.to_string(),
            value_field: value_field.to_string(),
        }
    }

    /// `{"type": "pinState", "pin": K, "state": V}`
    pub fn pin_state() -> Self {
        Self::new(Some("pinState"), "pin", "state")
    }

    /// The value `message` reports for `key`, if it is a state message
    /// about that key.
    pub fn value_for<'a>(&self, message: &'a RawMessage, key: &str) -> Option<&'a Value> {
        let object = message.payload.as_json()?.as_object()?;
        if let Some(expected) = &self.message_type {
            if object.get("type").and_then(Value::as_str) != Some(expected.as_str()) {
                return None;
            }
        }
        if !key_equals(object.get(&self.key_field)?, key) {
            return None;
        }
        object.get(&self.value_field)
    }

    /// The most recent state message for `key`.
    pub fn latest<'a>(&self, snapshot: &'a Snapshot, key: &str) -> Option<&'a Arc<RawMessage>> {
        snapshot.latest_where(|m| self.value_for(m, key).is_some())
    }

    /// The current value of `key`: the value of its most recent message.
    pub fn current<'a>(&self, snapshot: &'a Snapshot, key: &str) -> Option<&'a Value> {
        self.latest(snapshot, key)
            .and_then(|message| self.value_for(message, key))
    }
}

/// Keys are usually strings (`"D12"`), but numeric keys compare by text.
fn key_equals(field: &Value, key: &str) -> bool {
    match field {
        Value::String(s) => s == key,
        Value::Number(n) => n.to_string() == key,
        _ => false,
    }
}
