//! Client-facing message schema.
//!
//! Every WebSocket text frame carries one JSON object tagged by `type`.
//!
//! Inbound ([`ClientMessage`]):
//!
//! ```json
//! {"type": "question", "question": "hello", "conversation_id": "c1", "followup": true}
//! {"type": "stop", "task_id": "..."}
//! {"type": "check_status", "task_id": "..."}
//! ```
//!
//! Outbound ([`ServerMessage`]):
//!
//! ```json
//! {"type": "task_started", "task_id": "..."}
//! {"type": "llm_response", "event": "message", "data": "..."}
//! {"type": "command_sent", "command": "stop", "task_id": "..."}
//! {"type": "task_status", "task_id": "...", "state": "running", "ready": false, "successful": null}
//! {"type": "error", "message": "..."}
//! ```

use crate::{
    Error, Result,
    event::{ControlCommand, EventKind, ResponseEvent},
    types::{ConversationId, CorrelationId},
};
use serde::{Deserialize, Serialize};

/// Message received from a client connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Ask a question. With a `conversation_id` and `followup` set, the
    /// conversation's recent history is included in the prompt.
    Question {
        question: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<ConversationId>,
        #[serde(default)]
        followup: bool,
    },
    /// Abort a job this connection started.
    Stop { task_id: CorrelationId },
    /// Ask the job queue for the state of a job.
    CheckStatus { task_id: CorrelationId },
}

impl ClientMessage {
    /// Parses one inbound text frame.
    ///
    /// # Errors
    ///
    /// Malformed JSON, an unknown `type` or a missing required field all map
    /// to [`Error::ProtocolViolation`].
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::protocol(e.to_string()))
    }
}

/// Message sent to a client connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    TaskStarted {
        task_id: CorrelationId,
    },
    LlmResponse {
        event: EventKind,
        data: String,
    },
    CommandSent {
        command: String,
        task_id: CorrelationId,
    },
    TaskStatus {
        task_id: CorrelationId,
        state: JobState,
        ready: bool,
        successful: Option<bool>,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn command_sent(command: ControlCommand, task_id: CorrelationId) -> Self {
        Self::CommandSent {
            command: command.name().to_string(),
            task_id,
        }
    }

    pub fn task_status(task_id: CorrelationId, state: JobState) -> Self {
        Self::TaskStatus {
            task_id,
            state,
            ready: state.ready(),
            successful: state.successful(),
        }
    }

    pub fn to_json(&self) -> String {
        // Every variant is a struct of strings and booleans.
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl From<ResponseEvent> for ServerMessage {
    fn from(event: ResponseEvent) -> Self {
        let (event, data) = event.into_parts();
        Self::LlmResponse { event, data }
    }
}

impl From<&Error> for ServerMessage {
    fn from(err: &Error) -> Self {
        Self::Error {
            message: err.to_string(),
        }
    }
}

/// Lifecycle state of a job as reported by the job queue.
///
/// `Unknown` is reported for ids the queue never saw and for jobs whose
/// terminal state has already been reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl JobState {
    pub const fn ready(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub const fn successful(self) -> Option<bool> {
        match self {
            Self::Succeeded => Some(true),
            Self::Failed => Some(false),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_question_with_optional_fields() {
        let msg = ClientMessage::parse(r#"{"type":"question","question":"hello"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Question {
                question: "hello".into(),
                conversation_id: None,
                followup: false,
            }
        );

        let msg = ClientMessage::parse(
            r#"{"type":"question","question":"and then?","conversation_id":"c1","followup":true}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Question {
                question: "and then?".into(),
                conversation_id: Some("c1".into()),
                followup: true,
            }
        );
    }

    #[test]
    fn parses_stop_and_check_status() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"stop","task_id":"t1"}"#).unwrap(),
            ClientMessage::Stop {
                task_id: "t1".into()
            }
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"check_status","task_id":"t1"}"#).unwrap(),
            ClientMessage::CheckStatus {
                task_id: "t1".into()
            }
        );
    }

    #[test]
    fn rejects_malformed_messages() {
        for bad in [
            "not json",
            r#"{"type":"dance"}"#,
            r#"{"type":"stop"}"#,
            r#"{"type":"question"}"#,
            r#"{"question":"no type"}"#,
        ] {
            assert!(
                matches!(
                    ClientMessage::parse(bad),
                    Err(Error::ProtocolViolation { .. })
                ),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn outbound_wire_shapes() {
        let started = ServerMessage::TaskStarted {
            task_id: "t1".into(),
        };
        assert_eq!(
            serde_json::to_value(&started).unwrap(),
            json!({"type": "task_started", "task_id": "t1"})
        );

        let response = ServerMessage::from(ResponseEvent::message("chunk"));
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"type": "llm_response", "event": "message", "data": "chunk"})
        );

        let sent = ServerMessage::command_sent(ControlCommand::Stop, "t1".into());
        assert_eq!(
            serde_json::to_value(&sent).unwrap(),
            json!({"type": "command_sent", "command": "stop", "task_id": "t1"})
        );
    }

    #[test]
    fn task_status_reports_null_success_until_ready() {
        let running = ServerMessage::task_status("t1".into(), JobState::Running);
        assert_eq!(
            serde_json::to_value(&running).unwrap(),
            json!({"type": "task_status", "task_id": "t1", "state": "running", "ready": false, "successful": null})
        );

        let failed = ServerMessage::task_status("t1".into(), JobState::Failed);
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            json!({"type": "task_status", "task_id": "t1", "state": "failed", "ready": true, "successful": false})
        );

        let unknown = ServerMessage::task_status("t1".into(), JobState::Unknown);
        assert_eq!(
            serde_json::to_value(&unknown).unwrap(),
            json!({"type": "task_status", "task_id": "t1", "state": "unknown", "ready": false, "successful": null})
        );
    }
}
