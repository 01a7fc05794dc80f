use super::listener::StopListener;
use crate::server::{
    bus::{ChannelBus, publish_event},
    history::{ConversationStore, Turn},
    llm::LlmBackend,
    pool::Job,
    prompt::{Prompt, PromptRenderer},
    telemetry::{increment_chunks_published, increment_job_failures, increment_jobs_interrupted},
};
use core::time::Duration;
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tutor_stream_core::{
    event::ResponseEvent,
    protocol::JobState,
    types::{CorrelationId, control_channel},
};

/// Collaborators shared by every job a worker runs.
pub struct GenerationContext {
    pub bus: Arc<dyn ChannelBus>,
    pub llm: Arc<dyn LlmBackend>,
    pub prompt: Arc<dyn PromptRenderer>,
    /// `None` disables multi-turn conversations.
    pub history: Option<Arc<ConversationStore>>,
    pub stop_poll_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Interrupted,
    Failed,
}

impl JobOutcome {
    /// Queue state for the outcome. An interrupted job still finished
    /// normally from the queue's point of view.
    pub const fn state(self) -> JobState {
        match self {
            Self::Completed | Self::Interrupted => JobState::Succeeded,
            Self::Failed => JobState::Failed,
        }
    }
}

/// Runs one generation job to completion.
///
/// Publishes `start`, then zero or more `message` events, then at most one
/// `interrupted` or `error`, then exactly one `end` on the job's response
/// channel. Generation errors are reported as events and never propagate.
///
/// # Behavior
///
/// - The control channel is subscribed before anything is published, so a
///   stop sent right after `start` is seen.
/// - `cancel` is checked before generation and raced against every chunk.
/// - After each published chunk the task yields so the stop listener runs.
/// - History is appended only when generation completed.
#[tracing::instrument(skip_all, fields(task_id = %job.correlation_id, worker_id = worker_id))]
pub async fn process_job(
    worker_id: usize,
    job: &Job,
    cancel: &CancellationToken,
    ctx: &GenerationContext,
) -> JobOutcome {
    let id = &job.correlation_id;
    let bus = ctx.bus.as_ref();

    let control = match bus.subscribe(&control_channel(id)).await {
        Ok(sub) => sub,
        Err(e) => {
            tracing::error!("Failed to subscribe to control channel: {e}");
            emit(bus, id, &ResponseEvent::start()).await;
            emit(bus, id, &ResponseEvent::error(e.client_message())).await;
            emit(bus, id, &ResponseEvent::end()).await;
            increment_job_failures();
            return JobOutcome::Failed;
        }
    };
    let listener = StopListener::spawn(control, cancel.clone(), ctx.stop_poll_interval);

    // Held until history is written so follow-ups in the same conversation
    // observe this turn.
    let mut lease = match (&ctx.history, &job.conversation_id) {
        (Some(store), Some(conversation)) => tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            lease = store.lease(conversation) => Some((lease, store.capacity())),
        },
        _ => None,
    };

    let history = match &lease {
        Some((lease, turns)) if job.request.followup => lease.read_recent(*turns),
        _ => Vec::new(),
    };
    let prompt = ctx
        .prompt
        .render(&job.request.question, &history, job.request.followup);

    emit(bus, id, &ResponseEvent::start()).await;
    let (outcome, response) = generate(bus, id, prompt, cancel, ctx.llm.as_ref()).await;
    emit(bus, id, &ResponseEvent::end()).await;

    listener.stop().await;

    match outcome {
        JobOutcome::Completed => {
            if let Some((lease, _)) = lease.as_mut() {
                lease.append_turn(Turn::user(job.request.question.as_str()));
                lease.append_turn(Turn::assistant(response));
            }
            tracing::debug!("Generation completed");
        }
        JobOutcome::Interrupted => {
            increment_jobs_interrupted();
            tracing::debug!("Generation interrupted");
        }
        JobOutcome::Failed => increment_job_failures(),
    }

    outcome
}

async fn generate(
    bus: &dyn ChannelBus,
    id: &CorrelationId,
    prompt: Prompt,
    cancel: &CancellationToken,
    llm: &dyn LlmBackend,
) -> (JobOutcome, String) {
    let mut response = String::new();

    if cancel.is_cancelled() {
        emit(bus, id, &ResponseEvent::interrupted()).await;
        return (JobOutcome::Interrupted, response);
    }

    let mut chunks = llm.stream(prompt);
    let outcome = loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => break JobOutcome::Interrupted,
            next = chunks.next() => next,
        };

        match next {
            None => break JobOutcome::Completed,
            Some(Ok(_)) if cancel.is_cancelled() => break JobOutcome::Interrupted,
            Some(Ok(chunk)) => {
                response.push_str(&chunk);
                emit(bus, id, &ResponseEvent::message(chunk)).await;
                increment_chunks_published();
                tokio::task::yield_now().await;
            }
            Some(Err(e)) => {
                tracing::warn!("Generation failed: {e}");
                emit(bus, id, &ResponseEvent::error(e.client_message())).await;
                break JobOutcome::Failed;
            }
        }
    };
    // Abandon the upstream request before reporting.
    drop(chunks);

    if outcome == JobOutcome::Interrupted {
        emit(bus, id, &ResponseEvent::interrupted()).await;
    }
    (outcome, response)
}

async fn emit(bus: &dyn ChannelBus, id: &CorrelationId, event: &ResponseEvent) {
    if let Err(e) = publish_event(bus, id, event).await {
        tracing::warn!("Failed to publish {:?} event: {e}", event.kind());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{
        bus::InMemoryBus,
        generation::testing::{collect_events, context_with},
        history::Role,
        llm::testing::ScriptedBackend,
    };
    use tutor_stream_core::{event::ControlCommand, types::response_channel};

    fn job(question: &str) -> Job {
        Job::new(CorrelationId::generate(), question, None, false)
    }

    #[tokio::test]
    async fn publishes_start_messages_end() {
        let bus = InMemoryBus::new();
        let ctx = context_with(ScriptedBackend::chunks(["Hel", "lo"]), &bus);
        let job = job("hi");
        let sub = bus.subscribe(&response_channel(&job.correlation_id)).await.unwrap();

        let outcome = process_job(0, &job, &CancellationToken::new(), &ctx).await;

        assert_eq!(outcome, JobOutcome::Completed);
        assert_eq!(
            collect_events(sub).await,
            vec![
                ResponseEvent::start(),
                ResponseEvent::message("Hel"),
                ResponseEvent::message("lo"),
                ResponseEvent::end(),
            ]
        );
        assert_eq!(bus.subscriber_count(&control_channel(&job.correlation_id)), 0);
    }

    #[tokio::test]
    async fn generation_errors_become_error_events() {
        let bus = InMemoryBus::new();
        let ctx = context_with(ScriptedBackend::failing_after(["a"], "model crashed"), &bus);
        let job = job("hi");
        let sub = bus.subscribe(&response_channel(&job.correlation_id)).await.unwrap();

        let outcome = process_job(0, &job, &CancellationToken::new(), &ctx).await;

        assert_eq!(outcome, JobOutcome::Failed);
        assert_eq!(outcome.state(), JobState::Failed);
        assert_eq!(
            collect_events(sub).await,
            vec![
                ResponseEvent::start(),
                ResponseEvent::message("a"),
                ResponseEvent::error("model crashed"),
                ResponseEvent::end(),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_command_interrupts_generation() {
        let bus = InMemoryBus::new();
        let ctx = context_with(ScriptedBackend::slow(500, Duration::from_millis(5)), &bus);
        let job = job("hi");
        let id = job.correlation_id.clone();
        let mut sub = bus.subscribe(&response_channel(&id)).await.unwrap();

        let worker = tokio::spawn({
            let job = job.clone();
            async move { process_job(0, &job, &CancellationToken::new(), &ctx).await }
        });

        // Wait for the first chunk, then stop.
        let mut seen = Vec::new();
        while seen.len() < 2 {
            seen.push(ResponseEvent::decode(&sub.recv().await.unwrap()).unwrap());
        }
        bus.publish(&control_channel(&id), ControlCommand::Stop.encode())
            .await
            .unwrap();

        let rest = collect_events(sub).await;
        assert_eq!(worker.await.unwrap(), JobOutcome::Interrupted);
        assert_eq!(seen, vec![ResponseEvent::start(), ResponseEvent::message("c0")]);
        assert_eq!(
            &rest[rest.len() - 2..],
            &[ResponseEvent::interrupted(), ResponseEvent::end()]
        );
        assert!(rest.len() < 100, "generation kept running after stop");
        assert_eq!(bus.subscriber_count(&control_channel(&id)), 0);
    }

    #[tokio::test]
    async fn cancelled_before_start_never_calls_the_model() {
        let bus = InMemoryBus::new();
        let backend = ScriptedBackend::chunks(["never"]);
        let ctx = context_with(backend.clone(), &bus);
        let job = job("hi");
        let sub = bus.subscribe(&response_channel(&job.correlation_id)).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = process_job(0, &job, &cancel, &ctx).await;

        assert_eq!(outcome, JobOutcome::Interrupted);
        assert_eq!(outcome.state(), JobState::Succeeded);
        assert_eq!(
            collect_events(sub).await,
            vec![
                ResponseEvent::start(),
                ResponseEvent::interrupted(),
                ResponseEvent::end()
            ]
        );
        assert!(backend.prompts().is_empty());
    }

    #[tokio::test]
    async fn completed_turns_feed_followups() {
        let bus = InMemoryBus::new();
        let backend = ScriptedBackend::chunks(["answer"]);
        let ctx = context_with(backend.clone(), &bus);
        let conversation = Some("conv-1".into());

        let first = Job::new(CorrelationId::generate(), "first", conversation.clone(), false);
        process_job(0, &first, &CancellationToken::new(), &ctx).await;

        let second = Job::new(CorrelationId::generate(), "second", conversation, true);
        process_job(0, &second, &CancellationToken::new(), &ctx).await;

        let prompts = backend.prompts();
        assert_eq!(prompts[0].len(), 2);
        let roles: Vec<_> = prompts[1].iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            [Role::System, Role::User, Role::Assistant, Role::User]
        );
        assert_eq!(prompts[1][1].content, "first");
        assert_eq!(prompts[1][2].content, "answer");
        assert_eq!(prompts[1][3].content, "second");
    }

    #[tokio::test]
    async fn interrupted_and_failed_turns_are_not_recorded() {
        let bus = InMemoryBus::new();
        let conversation: Option<tutor_stream_core::types::ConversationId> = Some("conv-1".into());

        let failing = context_with(ScriptedBackend::failing_after(["partial"], "boom"), &bus);
        let job = Job::new(CorrelationId::generate(), "q1", conversation.clone(), false);
        process_job(0, &job, &CancellationToken::new(), &failing).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let job = Job::new(CorrelationId::generate(), "q2", conversation.clone(), false);
        process_job(0, &job, &cancel, &failing).await;

        let store = failing.history.as_ref().unwrap();
        let lease = store.lease(conversation.as_ref().unwrap()).await;
        assert!(lease.is_empty());
    }

    #[tokio::test]
    async fn unavailable_bus_fails_the_job() {
        let bus = InMemoryBus::new();
        let ctx = context_with(ScriptedBackend::chunks(["a"]), &bus);
        bus.shutdown();

        let outcome = process_job(0, &job("hi"), &CancellationToken::new(), &ctx).await;
        assert_eq!(outcome, JobOutcome::Failed);
    }
}
