use core::time::Duration;
use parking_lot::Mutex;
use std::{collections::HashMap, time::Instant};
use tokio_util::sync::CancellationToken;
use tutor_stream_core::{Error, Result, protocol::JobState, types::CorrelationId};

/// Lifecycle bookkeeping for every job the queue has accepted.
///
/// Terminal states stay queryable for `retention`, after which the entry is
/// reaped and the job reports [`JobState::Unknown`]. Reaping is lazy: expired
/// entries are dropped when they are looked up or when a new job registers.
pub struct JobTable {
    entries: Mutex<HashMap<CorrelationId, Entry>>,
    retention: Duration,
}

struct Entry {
    state: JobState,
    cancel: CancellationToken,
    finished_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, retention: Duration, now: Instant) -> bool {
        self.finished_at
            .is_some_and(|at| now.duration_since(at) >= retention)
    }
}

impl JobTable {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            retention,
        }
    }

    /// Records a newly submitted job as pending.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SubmissionFailure`] if the id is already known.
    pub fn register(&self, id: &CorrelationId, cancel: CancellationToken) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| !entry.expired(self.retention, now));

        if entries.contains_key(id) {
            return Err(Error::SubmissionFailure {
                context: format!("correlation id {id} was already submitted"),
            });
        }

        entries.insert(
            id.clone(),
            Entry {
                state: JobState::Pending,
                cancel,
                finished_at: None,
            },
        );
        Ok(())
    }

    /// Forgets a job that never reached a worker.
    pub fn discard(&self, id: &CorrelationId) {
        self.entries.lock().remove(id);
    }

    pub fn mark_running(&self, id: &CorrelationId) {
        if let Some(entry) = self.entries.lock().get_mut(id) {
            entry.state = JobState::Running;
        }
    }

    pub fn finish(&self, id: &CorrelationId, state: JobState) {
        debug_assert!(state.ready());
        if let Some(entry) = self.entries.lock().get_mut(id) {
            entry.state = state;
            entry.finished_at = Some(Instant::now());
        }
    }

    pub fn state(&self, id: &CorrelationId) -> JobState {
        let mut entries = self.entries.lock();
        match entries.get(id) {
            Some(entry) if entry.expired(self.retention, Instant::now()) => {
                entries.remove(id);
                JobState::Unknown
            }
            Some(entry) => entry.state,
            None => JobState::Unknown,
        }
    }

    /// Cancels a job that has not finished yet. Returns whether a live job was
    /// found.
    pub fn revoke(&self, id: &CorrelationId) -> bool {
        match self.entries.lock().get(id) {
            Some(entry) if !entry.state.ready() => {
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Number of jobs that are pending or running.
    pub fn active(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|entry| !entry.state.ready())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_lifecycle() {
        let table = JobTable::new(Duration::from_secs(60));
        let id = CorrelationId::from("t1");

        assert_eq!(table.state(&id), JobState::Unknown);
        table.register(&id, CancellationToken::new()).unwrap();
        assert_eq!(table.state(&id), JobState::Pending);
        assert_eq!(table.active(), 1);

        table.mark_running(&id);
        assert_eq!(table.state(&id), JobState::Running);

        table.finish(&id, JobState::Succeeded);
        assert_eq!(table.state(&id), JobState::Succeeded);
        assert_eq!(table.active(), 0);
    }

    #[test]
    fn rejects_duplicate_ids() {
        let table = JobTable::new(Duration::from_secs(60));
        let id = CorrelationId::from("t1");
        table.register(&id, CancellationToken::new()).unwrap();
        assert!(matches!(
            table.register(&id, CancellationToken::new()),
            Err(Error::SubmissionFailure { .. })
        ));
    }

    #[test]
    fn reaped_jobs_report_unknown() {
        let table = JobTable::new(Duration::ZERO);
        let id = CorrelationId::from("t1");
        table.register(&id, CancellationToken::new()).unwrap();
        table.finish(&id, JobState::Failed);
        assert_eq!(table.state(&id), JobState::Unknown);
    }

    #[test]
    fn unfinished_jobs_are_never_reaped() {
        let table = JobTable::new(Duration::ZERO);
        let id = CorrelationId::from("t1");
        table.register(&id, CancellationToken::new()).unwrap();
        table.mark_running(&id);
        assert_eq!(table.state(&id), JobState::Running);
    }

    #[test]
    fn revoke_only_cancels_live_jobs() {
        let table = JobTable::new(Duration::from_secs(60));
        let live = CorrelationId::from("live");
        let done = CorrelationId::from("done");
        let live_token = CancellationToken::new();
        let done_token = CancellationToken::new();

        table.register(&live, live_token.clone()).unwrap();
        table.register(&done, done_token.clone()).unwrap();
        table.finish(&done, JobState::Succeeded);

        assert!(table.revoke(&live));
        assert!(live_token.is_cancelled());
        assert!(!table.revoke(&done));
        assert!(!done_token.is_cancelled());
        assert!(!table.revoke(&"missing".into()));
    }
}
