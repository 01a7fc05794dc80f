//! # Identifiers and Channel Naming
//!
//! This module defines the identifiers that bind a client request to its
//! generation job, and the channel names derived from them. Publishers and
//! subscribers must derive channel names through the helpers below so both
//! sides agree byte for byte.
//!
//! ## Channels
//!
//! - [`response_channel`] - `llm_response:<id>`, carries ordered
//!   [`ResponseEvent`](crate::event::ResponseEvent)s from the worker
//! - [`control_channel`] - `llm_control:<id>`, carries
//!   [`ControlCommand`](crate::event::ControlCommand)s to the worker
//!
//! There is no whitespace after the colon. A subscriber listening on
//! `llm_control: <id>` would never observe a stop.

use core::fmt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix of the channel carrying response events for one job.
pub const RESPONSE_CHANNEL_PREFIX: &str = "llm_response:";

/// Prefix of the channel carrying control commands for one job.
pub const CONTROL_CHANNEL_PREFIX: &str = "llm_control:";

/// Unique token binding a generation job to its channel pair and to the
/// client request that spawned it.
///
/// Ids are generated server-side and never reused across jobs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generates a fresh random (v4) correlation id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Client-supplied key grouping the jobs of one multi-turn conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConversationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ConversationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Name of the channel the worker publishes response events on.
pub fn response_channel(id: &CorrelationId) -> String {
    format!("{RESPONSE_CHANNEL_PREFIX}{id}")
}

/// Name of the channel the worker listens on for control commands.
pub fn control_channel(id: &CorrelationId) -> String {
    format!("{CONTROL_CHANNEL_PREFIX}{id}")
}
