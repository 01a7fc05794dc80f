//! Connection session.
//!
//! One [`Session`] serves one client connection. It turns inbound
//! [`ClientMessage`]s into jobs, stop commands and status queries, and runs
//! one relay task per submitted job that forwards the job's response channel
//! to the client. Relays run concurrently with inbound handling, so a long
//! answer never delays a `stop` or `check_status` for another job.
//!
//! When the connection ends, every job still registered receives a `stop` on
//! its control channel. The same happens from [`Drop`] if the session future
//! is dropped before it finished, and when a relay gives up on a job before
//! its `end`.
//!
//! - [`registry`] - [`ActiveJobs`], the per-connection job registry.
//! - [`relay`] - forwards one response channel to the client.

pub mod registry;
pub mod relay;

use crate::server::{
    bus::{ChannelBus, publish_command},
    pool::{Job, JobQueue},
    telemetry::{decrement_sessions_active, increment_sessions_active, increment_stop_commands},
};
use core::time::Duration;
use futures::{Stream, StreamExt};
use registry::ActiveJobs;
use relay::{RelayExit, relay_events};
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tutor_stream_core::{
    event::ControlCommand,
    protocol::{ClientMessage, ServerMessage},
    types::{ConversationId, CorrelationId, response_channel},
};

pub struct Session {
    bus: Arc<dyn ChannelBus>,
    queue: Arc<JobQueue>,
    outbound: mpsc::Sender<ServerMessage>,
    active: ActiveJobs,
    relays: JoinSet<(CorrelationId, RelayExit)>,
    relay_idle_timeout: Option<Duration>,
}

impl Session {
    pub fn new(
        bus: Arc<dyn ChannelBus>,
        queue: Arc<JobQueue>,
        outbound: mpsc::Sender<ServerMessage>,
        relay_idle_timeout: Option<Duration>,
    ) -> Self {
        increment_sessions_active();
        Self {
            bus,
            queue,
            outbound,
            active: ActiveJobs::default(),
            relays: JoinSet::new(),
            relay_idle_timeout,
        }
    }

    /// Serves the connection until `inbound` ends or the client stops
    /// reading, then tears the session down.
    pub async fn run<S>(mut self, inbound: S)
    where
        S: Stream<Item = String> + Send,
    {
        let mut inbound = core::pin::pin!(inbound);

        loop {
            tokio::select! {
                Some(joined) = self.relays.join_next(), if !self.relays.is_empty() => {
                    match joined {
                        Ok((id, exit)) => self.reap(id, exit).await,
                        Err(e) if e.is_cancelled() => {}
                        Err(e) => tracing::error!("Relay task failed: {e}"),
                    }
                }
                frame = inbound.next() => {
                    let Some(text) = frame else { break };
                    self.handle_frame(&text).await;
                    if self.outbound.is_closed() {
                        break;
                    }
                }
            }
        }

        self.teardown().await;
    }

    async fn handle_frame(&mut self, text: &str) {
        match ClientMessage::parse(text) {
            Ok(ClientMessage::Question {
                question,
                conversation_id,
                followup,
            }) => self.on_question(question, conversation_id, followup).await,
            Ok(ClientMessage::Stop { task_id }) => self.on_stop(task_id).await,
            Ok(ClientMessage::CheckStatus { task_id }) => {
                let state = self.queue.status(&task_id);
                send(&self.outbound, ServerMessage::task_status(task_id, state)).await;
            }
            Err(e) => tracing::warn!("Ignoring client frame: {e}"),
        }
    }

    async fn on_question(
        &mut self,
        question: String,
        conversation_id: Option<ConversationId>,
        followup: bool,
    ) {
        let id = CorrelationId::generate();

        // The bus keeps nothing, so the relay's subscription must exist
        // before the worker can publish `start`.
        let sub = match self.bus.subscribe(&response_channel(&id)).await {
            Ok(sub) => sub,
            Err(e) => {
                tracing::error!("Failed to subscribe for {id}: {e}");
                send(&self.outbound, ServerMessage::from(&e)).await;
                return;
            }
        };

        let job = Job::new(id.clone(), question, conversation_id, followup);
        if let Err(e) = self.queue.submit(job).await {
            tracing::error!("Failed to submit {id}: {e}");
            send(&self.outbound, ServerMessage::from(&e)).await;
            return;
        }

        send(&self.outbound, ServerMessage::TaskStarted {
            task_id: id.clone(),
        })
        .await;

        let ended = CancellationToken::new();
        let relay = self.relays.spawn(relay_events(
            id.clone(),
            sub,
            self.outbound.clone(),
            self.relay_idle_timeout,
            ended.clone(),
        ));
        self.active.insert(id, relay, ended);
    }

    async fn on_stop(&mut self, id: CorrelationId) {
        if !self.active.is_live(&id) {
            tracing::debug!("Stop for inactive task {id} ignored");
            return;
        }

        let published = stop_job(self.bus.as_ref(), &self.queue, &id).await;
        // The relay keeps running so the client still sees `interrupted` and
        // `end`.
        self.active.remove(&id);

        match published {
            Ok(()) => {
                send(&self.outbound, ServerMessage::command_sent(ControlCommand::Stop, id))
                    .await;
            }
            Err(e) => {
                tracing::warn!("Failed to publish stop for {id}: {e}");
                send(&self.outbound, ServerMessage::from(&e)).await;
            }
        }
    }

    /// Clears a finished relay's entry. A relay that gave up before `end`
    /// leaves its job running, so the job is stopped here unless the client
    /// already stopped it.
    async fn reap(&mut self, id: CorrelationId, exit: RelayExit) {
        if !self.active.remove(&id) || exit == RelayExit::Ended {
            return;
        }

        tracing::debug!("Relay for {id} gave up, stopping the job");
        if let Err(e) = stop_job(self.bus.as_ref(), &self.queue, &id).await {
            tracing::warn!("Failed to publish stop for {id}: {e}");
        }
    }

    /// Stops every outstanding job and cancels all relays.
    async fn teardown(&mut self) {
        let outstanding = self.active.drain_live();
        if !outstanding.is_empty() {
            tracing::debug!("Stopping {} outstanding jobs", outstanding.len());
        }

        for id in outstanding {
            if let Err(e) = stop_job(self.bus.as_ref(), &self.queue, &id).await {
                tracing::warn!("Failed to publish stop for {id}: {e}");
            }
        }

        self.relays.shutdown().await;
    }
}

/// Publishes `stop` for `id` and revokes it locally. The revoke covers a job
/// still waiting for a worker, which has no listener yet.
async fn stop_job(
    bus: &dyn ChannelBus,
    queue: &JobQueue,
    id: &CorrelationId,
) -> tutor_stream_core::Result<()> {
    queue.revoke(id);
    publish_command(bus, id, ControlCommand::Stop).await?;
    increment_stop_commands();
    Ok(())
}

async fn send(outbound: &mpsc::Sender<ServerMessage>, message: ServerMessage) {
    if outbound.send(message).await.is_err() {
        tracing::debug!("Client connection closed, dropping outbound message");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        decrement_sessions_active();

        let ids = self.active.drain_live();
        if ids.is_empty() {
            return;
        }

        for id in &ids {
            self.queue.revoke(id);
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("Session dropped outside a runtime, {} stops not sent", ids.len());
            return;
        };

        let bus = Arc::clone(&self.bus);
        runtime.spawn(async move {
            for id in ids {
                match publish_command(bus.as_ref(), &id, ControlCommand::Stop).await {
                    Ok(()) => increment_stop_commands(),
                    Err(e) => tracing::warn!("Failed to publish stop for {id}: {e}"),
                }
            }
        });
    }
}
