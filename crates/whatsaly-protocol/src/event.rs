//! Tagged line protocol spoken by worker processes on standard output.
//!
//! A structured event is a single line made of [`EVENT_MARKER`] followed by a
//! JSON object `{"tag": "...", "payload": {...}}`. Every other line is a raw
//! log line.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const EVENT_MARKER: &str = "[GO_DATA]";

pub const TAG_PAIRING_CODE: &str = "PAIRING_CODE";
pub const TAG_CONNECTION_UPDATE: &str = "CONNECTION_UPDATE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedEvent {
    pub tag: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedLine<'a> {
    Event(TaggedEvent),
    Raw(&'a str),
    /// Marker present but the remainder was not a valid event envelope.
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionUpdate {
    Connected,
    LoggedOut,
    QrCode,
    Other(String),
}

impl ConnectionUpdate {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "connected" => Self::Connected,
            "logged_out" => Self::LoggedOut,
            "qr_code" => Self::QrCode,
            other => Self::Other(other.to_owned()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    PairingCode(String),
    Connection(ConnectionUpdate),
}

pub fn decode_line(line: &str) -> DecodedLine<'_> {
    let Some(body) = line.strip_prefix(EVENT_MARKER) else {
        return DecodedLine::Raw(line);
    };
    match serde_json::from_str::<TaggedEvent>(body) {
        Ok(event) => DecodedLine::Event(event),
        Err(error) => DecodedLine::Skipped {
            reason: error.to_string(),
        },
    }
}

impl TaggedEvent {
    pub fn new(tag: impl Into<String>, payload: Value) -> Self {
        Self {
            tag: tag.into(),
            payload,
        }
    }

    pub fn payload_text(&self, field: &str) -> Option<String> {
        self.payload.get(field).and_then(stringify_value)
    }

    /// Interprets the envelope. Unknown tags, and known tags whose required
    /// payload field is missing or null, yield `None`.
    pub fn interpret(&self) -> Option<WorkerEvent> {
        match self.tag.as_str() {
            TAG_PAIRING_CODE => self.payload_text("code").map(WorkerEvent::PairingCode),
            TAG_CONNECTION_UPDATE => self
                .payload_text("status")
                .map(|status| WorkerEvent::Connection(ConnectionUpdate::parse(status.as_str()))),
            _ => None,
        }
    }

    pub fn to_line(&self) -> String {
        let body = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_owned());
        format!("{EVENT_MARKER}{body}")
    }
}

fn stringify_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Number(number) => Some(number.to_string()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}
