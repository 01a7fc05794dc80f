//! Error types for the streaming coordinator.
//!
//! This module defines the central `Error` enum, which captures every
//! recoverable and reportable failure between a connection session, the job
//! queue, the generation workers and the channel bus.
//!
//! ## Error Cases
//! - `SubmissionFailure`: The job queue could not accept a job.
//! - `GenerationFailure`: The LLM collaborator failed before or mid-stream.
//! - `ChannelFailure`: A publish/subscribe operation on the bus failed.
//! - `ProtocolViolation`: An inbound message or bus payload was malformed.
//! - `ServiceShutdown`: Work arrived while the service was shutting down.

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the streaming coordinator.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The job queue is unreachable or its worker channel is closed.
    #[error("Submission failed: {context}")]
    SubmissionFailure { context: String },

    /// The LLM collaborator reported an error.
    #[error("Generation failed: {message}")]
    GenerationFailure { message: String },

    /// Publish or subscribe on the channel bus failed.
    #[error("Channel error: {context}")]
    ChannelFailure { context: String },

    /// A client message or bus payload could not be understood.
    #[error("Protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    pub fn generation(message: impl Into<String>) -> Self {
        Self::GenerationFailure {
            message: message.into(),
        }
    }

    pub fn channel(context: impl Into<String>) -> Self {
        Self::ChannelFailure {
            context: context.into(),
        }
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            reason: reason.into(),
        }
    }

    /// Message reported to the client in an `error` response event.
    ///
    /// Generation failures report the collaborator's own message; every other
    /// case uses the full display form. Never empty.
    pub fn client_message(&self) -> String {
        let msg = match self {
            Self::GenerationFailure { message } => message.clone(),
            other => other.to_string(),
        };
        if msg.trim().is_empty() {
            "generation failed".to_string()
        } else {
            msg
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::protocol(err.to_string())
    }
}
