//! Payloads carried on the channel bus.
//!
//! A worker publishes [`ResponseEvent`]s on the response channel of its job
//! and listens for [`ControlCommand`]s on the control channel. Both are JSON
//! encoded:
//!
//! ```json
//! {"event": "message", "data": "Hello"}
//! {"command": "stop"}
//! ```
//!
//! Within one response channel the grammar is: exactly one `start`, zero or
//! more `message`, at most one of `interrupted` / `error`, and exactly one
//! final `end`.

use crate::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Discriminant of a [`ResponseEvent`], as it appears in the `event` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Start,
    Message,
    Interrupted,
    Error,
    End,
}

/// One event on a job's response channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum ResponseEvent {
    Start(String),
    Message(String),
    Interrupted(String),
    Error(String),
    End(String),
}

impl ResponseEvent {
    pub fn start() -> Self {
        Self::Start("begin reply".to_string())
    }

    pub fn message(text: impl Into<String>) -> Self {
        Self::Message(text.into())
    }

    pub fn interrupted() -> Self {
        Self::Interrupted("generation was interrupted by user".to_string())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    pub fn end() -> Self {
        Self::End("end reply".to_string())
    }

    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Start(_) => EventKind::Start,
            Self::Message(_) => EventKind::Message,
            Self::Interrupted(_) => EventKind::Interrupted,
            Self::Error(_) => EventKind::Error,
            Self::End(_) => EventKind::End,
        }
    }

    pub fn data(&self) -> &str {
        match self {
            Self::Start(d)
            | Self::Message(d)
            | Self::Interrupted(d)
            | Self::Error(d)
            | Self::End(d) => d,
        }
    }

    pub fn into_parts(self) -> (EventKind, String) {
        let kind = self.kind();
        match self {
            Self::Start(d)
            | Self::Message(d)
            | Self::Interrupted(d)
            | Self::Error(d)
            | Self::End(d) => (kind, d),
        }
    }

    /// Only `end` closes a response channel. `interrupted` and `error` are
    /// always followed by it.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::End(_))
    }

    pub fn encode(&self) -> Bytes {
        encode_json(self)
    }

    /// # Errors
    ///
    /// Returns [`Error::ProtocolViolation`](crate::Error::ProtocolViolation) if `payload` is not a valid event.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Command sent from a connection session to the worker running a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum ControlCommand {
    Stop,
}

impl ControlCommand {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Stop => "stop",
        }
    }

    pub fn encode(self) -> Bytes {
        encode_json(&self)
    }

    /// # Errors
    ///
    /// Returns [`Error::ProtocolViolation`](crate::Error::ProtocolViolation) for unknown or malformed commands.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

fn encode_json<T: Serialize>(value: &T) -> Bytes {
    // Plain enums of strings; serialization cannot fail.
    Bytes::from(serde_json::to_vec(value).unwrap_or_default())
}
