//! In-process job queue backed by a pool of asynchronous workers.
//!
//! This module defines the [`JobQueue`] struct, which hands generation
//! [`Job`]s to a set of worker tasks using round-robin scheduling and
//! supports coordinated shutdown via a shared [`CancellationToken`].
//!
//! Each worker listens on its own bounded [`mpsc::Receiver`]. A job is handed
//! to exactly one worker and runs there independently of the connection that
//! submitted it: the submitting session may disconnect without affecting the
//! job, which remains cancellable through its control channel.

use super::{
    request::{Job, WorkRequest},
    status::JobTable,
    worker::worker_loop,
};
use crate::server::{
    config::ServerConfig, generation::GenerationContext,
    telemetry::increment_jobs_submitted,
};
use core::time::Duration;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};
use tokio::{
    sync::{mpsc, oneshot},
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tutor_stream_core::{Error, Result, protocol::JobState, types::CorrelationId};

/// A cooperative pool of asynchronous workers that run generation [`Job`]s.
pub struct JobQueue {
    workers: Vec<mpsc::Sender<WorkRequest>>,
    next_worker: AtomicUsize,
    jobs: Arc<JobTable>,
    accepting: AtomicBool,
    shutdown_token: CancellationToken,
    shutdown_timeout: Duration,
}

impl JobQueue {
    /// Constructs a [`JobQueue`] from initialized worker channels.
    pub const fn new(
        workers: Vec<mpsc::Sender<WorkRequest>>,
        jobs: Arc<JobTable>,
        shutdown_token: CancellationToken,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            workers,
            next_worker: AtomicUsize::new(0),
            jobs,
            accepting: AtomicBool::new(true),
            shutdown_token,
            shutdown_timeout,
        }
    }

    /// Spawns `config.num_workers` worker tasks sharing `ctx` and returns the
    /// queue feeding them.
    pub fn start(config: &ServerConfig, ctx: Arc<GenerationContext>) -> Self {
        let jobs = Arc::new(JobTable::new(config.status_retention));
        let shutdown_token = CancellationToken::new();
        let mut workers = Vec::with_capacity(config.num_workers);

        for worker_id in 0..config.num_workers {
            let (tx, rx) = mpsc::channel(config.work_queue_capacity);
            workers.push(tx);

            tokio::spawn(worker_loop(
                worker_id,
                rx,
                Arc::clone(&ctx),
                Arc::clone(&jobs),
                config.jobs_per_worker,
            ));
        }

        Self::new(workers, jobs, shutdown_token, config.shutdown_timeout)
    }

    /// Returns the index of the next worker to receive work (round-robin).
    pub fn next_worker_index(&self) -> usize {
        self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len()
    }

    /// Sends a [`Job`] to the next worker in the pool.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The service is shutting down.
    /// - The correlation id was submitted before.
    /// - The worker's channel is closed.
    pub async fn submit(&self, job: Job) -> Result<()> {
        if !self.accepting.load(Ordering::Acquire) || self.shutdown_token.is_cancelled() {
            return Err(Error::ServiceShutdown);
        }

        let id = job.correlation_id.clone();
        let cancel = self.shutdown_token.child_token();
        self.jobs.register(&id, cancel.clone())?;

        let worker_idx = self.next_worker_index();
        match self.workers[worker_idx]
            .send(WorkRequest::Run { job, cancel })
            .await
        {
            Ok(()) => {
                increment_jobs_submitted();
                tracing::debug!("Job {id} queued on worker {worker_idx}");
                Ok(())
            }
            Err(_) => {
                self.jobs.discard(&id);
                Err(Error::SubmissionFailure {
                    context: format!("Worker {worker_idx} channel closed"),
                })
            }
        }
    }

    /// Non-blocking status lookup. Ids that were never submitted, or whose
    /// terminal state has been reaped, report [`JobState::Unknown`].
    pub fn status(&self, id: &CorrelationId) -> JobState {
        self.jobs.state(id)
    }

    /// Cancels a pending or running job without going through the bus.
    pub fn revoke(&self, id: &CorrelationId) -> bool {
        self.jobs.revoke(id)
    }

    /// Number of jobs that are pending or running.
    pub fn inflight(&self) -> usize {
        self.jobs.active()
    }

    /// Gracefully shuts down all workers in the pool.
    ///
    /// - Refuses new jobs.
    /// - Waits up to the shutdown timeout for in-flight jobs to finish.
    /// - Cancels the remaining jobs, which report `interrupted` and `end`.
    /// - Sends a [`WorkRequest::Shutdown`] to each worker and waits (up to 3
    ///   seconds per worker) for acknowledgements.
    pub async fn shutdown(&self) -> Result<()> {
        // === Phase 0: Stop accepting new jobs ===
        tracing::info!("Refusing new jobs");
        self.accepting.store(false, Ordering::Release);

        // === Phase 1: Wait for in-flight jobs to drain ===
        tracing::info!("Draining in-flight jobs ({} active)", self.inflight());
        let drain_result = timeout(self.shutdown_timeout, async {
            while self.inflight() > 0 {
                sleep(Duration::from_millis(100)).await;
            }
        })
        .await;

        match drain_result {
            Ok(()) => tracing::debug!("All in-flight jobs drained successfully"),
            Err(_) => tracing::warn!(
                "Graceful drain timed out ({} jobs still active)",
                self.inflight()
            ),
        }

        // === Phase 2: Cancel any remaining work ===
        tracing::debug!("Cancelling remaining jobs via shutdown token");
        self.shutdown_token.cancel();

        // === Phase 3: Notify workers to shut down ===
        tracing::debug!("Notifying all workers to shut down");
        let mut shutdown_handles = Vec::with_capacity(self.workers.len());

        for (i, worker) in self.workers.iter().enumerate() {
            let (tx, rx) = oneshot::channel();
            if let Err(e) = worker.send(WorkRequest::Shutdown { response: tx }).await {
                tracing::error!("Failed to send shutdown to worker {i}: {e}");
            } else {
                shutdown_handles.push((i, rx));
            }
        }

        let timeout_futures = shutdown_handles.into_iter().map(|(i, rx)| async move {
            match timeout(Duration::from_secs(3), rx).await {
                Ok(Ok(())) => tracing::trace!("Worker {i} shutdown acknowledged"),
                Ok(Err(e)) => tracing::error!("Worker {i} returned error: {e}"),
                Err(_) => tracing::warn!("Worker {i} shutdown timed out"),
            }
        });

        futures::future::join_all(timeout_futures).await;

        tracing::info!("Job queue shutdown complete");
        Ok(())
    }
}
