use super::{
    request::{Job, WorkRequest},
    status::JobTable,
};
use crate::server::{
    generation::{GenerationContext, process_job},
    telemetry::{decrement_jobs_inflight, increment_jobs_inflight, record_job_duration},
};
use std::{sync::Arc, time::Instant};
use tokio::{
    sync::{Semaphore, mpsc},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tutor_stream_core::{protocol::JobState, types::CorrelationId};

/// Worker task responsible for processing [`WorkRequest`] messages.
///
/// The worker listens on an MPSC channel and runs up to `slots` jobs
/// concurrently. Jobs beyond that stay `pending` until a slot frees up. A job
/// cancelled while waiting for a slot never starts generating but still
/// reports `start`, `interrupted` and `end`.
///
/// # Request Types
///
/// - [`WorkRequest::Run`] - Runs one job via [`process_job`].
/// - [`WorkRequest::Shutdown`] - Waits for running jobs, then acknowledges.
pub async fn worker_loop(
    worker_id: usize,
    mut rx: mpsc::Receiver<WorkRequest>,
    ctx: Arc<GenerationContext>,
    jobs: Arc<JobTable>,
    slots: usize,
) {
    tracing::trace!("Worker {worker_id} started");

    let permits = Arc::new(Semaphore::new(slots));
    let mut running = JoinSet::new();

    loop {
        tokio::select! {
            Some(joined) = running.join_next(), if !running.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!("Worker {worker_id} job task failed: {e}");
                }
            }
            work = rx.recv() => {
                let Some(work) = work else { break };
                match work {
                    WorkRequest::Run { job, cancel } => {
                        running.spawn(run_slot(
                            worker_id,
                            job,
                            cancel,
                            Arc::clone(&ctx),
                            Arc::clone(&jobs),
                            Arc::clone(&permits),
                        ));
                    }
                    WorkRequest::Shutdown { response } => {
                        tracing::debug!("Worker {worker_id} received shutdown signal");

                        while let Some(joined) = running.join_next().await {
                            if let Err(e) = joined {
                                tracing::error!("Worker {worker_id} job task failed: {e}");
                            }
                        }

                        if response.send(()).is_err() {
                            tracing::error!("Worker {worker_id} failed to acknowledge shutdown");
                        }
                        break;
                    }
                }
            }
        }
    }

    tracing::trace!("Worker {worker_id} stopped");
}

async fn run_slot(
    worker_id: usize,
    job: Job,
    cancel: CancellationToken,
    ctx: Arc<GenerationContext>,
    jobs: Arc<JobTable>,
    permits: Arc<Semaphore>,
) {
    let mut guard = FinishGuard {
        jobs: &jobs,
        id: &job.correlation_id,
        state: JobState::Failed,
        inflight: false,
    };

    // A revoked job gives up its place in line immediately.
    let _permit = tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        permit = Arc::clone(&permits).acquire_owned() => permit.ok(),
    };

    jobs.mark_running(&job.correlation_id);
    increment_jobs_inflight();
    guard.inflight = true;
    let started = Instant::now();

    let outcome = process_job(worker_id, &job, &cancel, &ctx).await;

    record_job_duration(started.elapsed().as_secs_f64() * 1000.0);
    guard.state = outcome.state();
}

/// Records the job's terminal state on drop, so a panicking job still leaves
/// the table as `failed` instead of stuck in `running`, and the in-flight
/// gauge still goes back down.
struct FinishGuard<'a> {
    jobs: &'a JobTable,
    id: &'a CorrelationId,
    state: JobState,
    inflight: bool,
}

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        if self.inflight {
            decrement_jobs_inflight();
        }
        self.jobs.finish(self.id, self.state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_guard_marks_the_job_failed() {
        let jobs = JobTable::new(core::time::Duration::from_secs(60));
        let id = CorrelationId::from("a");
        jobs.register(&id, CancellationToken::new()).unwrap();
        jobs.mark_running(&id);

        drop(FinishGuard {
            jobs: &jobs,
            id: &id,
            state: JobState::Failed,
            inflight: true,
        });
        assert_eq!(jobs.state(&id), JobState::Failed);
    }
}
