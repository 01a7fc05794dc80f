//! Client-facing service and the wiring between its collaborators.
//!
//! [`ChatService`] owns the channel bus and the job queue and hands out one
//! [`Session`] per client connection. The HTTP/WebSocket routes live in
//! [`handler`].
//!
//! ## Structure
//!
//! - [`handler`] - axum router: health ping and the `/ws/llm` endpoint.

pub mod handler;

use crate::server::{
    bus::InMemoryBus,
    config::ServerConfig,
    generation::GenerationContext,
    history::ConversationStore,
    llm::{LlmBackend, OpenAiBackend},
    pool::JobQueue,
    prompt::TemplatePrompt,
    session::Session,
};
use core::time::Duration;
use std::sync::Arc;
use tokio::sync::mpsc;
use tutor_stream_core::{Result, protocol::ServerMessage};

/// Streaming chat service shared by every connection.
///
/// Cloning is cheap; clones share the same bus and job queue.
#[derive(Clone)]
pub struct ChatService {
    bus: InMemoryBus,
    queue: Arc<JobQueue>,
    relay_idle_timeout: Option<Duration>,
    outbound_buffer_size: usize,
}

impl ChatService {
    /// Creates the service against the configured OpenAI-compatible endpoint
    /// and spawns the worker pool.
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client for the LLM endpoint cannot be built.
    pub fn new(config: &ServerConfig) -> anyhow::Result<Self> {
        let llm = OpenAiBackend::new(&config.llm)?;
        Ok(Self::with_backend(config, Arc::new(llm)))
    }

    /// Creates the service with an explicit LLM backend.
    pub fn with_backend(config: &ServerConfig, llm: Arc<dyn LlmBackend>) -> Self {
        let bus = InMemoryBus::new();
        let history = config.multi_turn.then(|| {
            Arc::new(ConversationStore::new(
                config.history_turns,
                config.conversation_idle,
            ))
        });

        let ctx = GenerationContext {
            bus: Arc::new(bus.clone()),
            llm,
            prompt: Arc::new(TemplatePrompt::new(&config.prompt)),
            history,
            stop_poll_interval: config.stop_poll_interval,
        };
        let queue = JobQueue::start(config, Arc::new(ctx));

        Self {
            bus,
            queue: Arc::new(queue),
            relay_idle_timeout: config.relay_idle_timeout,
            outbound_buffer_size: config.outbound_buffer_size,
        }
    }

    /// Opens a session for a new connection. Messages for the client are
    /// delivered on the returned receiver.
    pub fn open_session(&self) -> (Session, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(self.outbound_buffer_size);
        let session = Session::new(
            Arc::new(self.bus.clone()),
            Arc::clone(&self.queue),
            tx,
            self.relay_idle_timeout,
        );
        (session, rx)
    }

    /// Drains and stops the job queue, then closes the bus.
    ///
    /// Jobs still running after the drain window report `interrupted` and
    /// `end` before the bus goes away.
    pub async fn shutdown(&self) -> Result<()> {
        self.queue.shutdown().await?;
        self.bus.shutdown();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::llm::testing::ScriptedBackend;
    use tutor_stream_core::event::EventKind;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sessions_share_the_queue() {
        let service = ChatService::with_backend(
            &ServerConfig::for_tests(),
            Arc::new(ScriptedBackend::chunks(["ok"])),
        );
        let (session, mut rx) = service.open_session();
        let (tx, inbound) = mpsc::unbounded_channel();
        let running = tokio::spawn(
            session.run(tokio_stream::wrappers::UnboundedReceiverStream::new(inbound)),
        );

        tx.send(r#"{"type":"question","question":"hi"}"#.to_string())
            .unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(ServerMessage::TaskStarted { .. })
        ));
        loop {
            match rx.recv().await {
                Some(ServerMessage::LlmResponse {
                    event: EventKind::End,
                    ..
                }) => break,
                Some(_) => {}
                None => panic!("session ended before end"),
            }
        }

        drop(tx);
        running.await.unwrap();
        service.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn questions_after_shutdown_get_an_error() {
        let service = ChatService::with_backend(
            &ServerConfig::for_tests(),
            Arc::new(ScriptedBackend::chunks(["ok"])),
        );
        service.shutdown().await.unwrap();

        let (session, mut rx) = service.open_session();
        let inbound = futures::stream::iter([r#"{"type":"question","question":"hi"}"#.to_string()]);
        session.run(inbound).await;

        assert!(matches!(rx.recv().await, Some(ServerMessage::Error { .. })));
    }
}
