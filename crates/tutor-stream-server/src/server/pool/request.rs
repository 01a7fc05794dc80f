use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tutor_stream_core::types::{ConversationId, CorrelationId};

/// What the client asked the model to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub question: String,
    /// Include the conversation's recent history in the prompt.
    pub followup: bool,
}

/// A generation job. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub correlation_id: CorrelationId,
    pub request: GenerationRequest,
    pub conversation_id: Option<ConversationId>,
}

impl Job {
    pub fn new(
        correlation_id: CorrelationId,
        question: impl Into<String>,
        conversation_id: Option<ConversationId>,
        followup: bool,
    ) -> Self {
        Self {
            correlation_id,
            request: GenerationRequest {
                question: question.into(),
                followup,
            },
            conversation_id,
        }
    }
}

/// A message sent from the job queue to an individual worker task.
///
/// [`WorkRequest`]s are sent over bounded asynchronous channels and are
/// consumed by the worker's main event loop.
#[derive(Debug)]
pub enum WorkRequest {
    /// Run one job.
    ///
    /// - `job`: The job to execute.
    /// - `cancel`: Cancelled by a stop command, a local revoke, or service
    ///   shutdown.
    Run {
        job: Job,
        cancel: CancellationToken,
    },

    /// Request the worker to shut down gracefully once its jobs finish.
    ///
    /// - `response`: One-shot channel for acknowledging that the worker has
    ///   completed its shutdown routine.
    Shutdown { response: oneshot::Sender<()> },
}
