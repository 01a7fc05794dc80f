use std::collections::HashMap;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tutor_stream_core::types::CorrelationId;

#[derive(Debug)]
struct Entry {
    relay: AbortHandle,
    ended: CancellationToken,
}

/// Jobs a connection submitted that have not terminated, been stopped, or
/// been torn down yet.
///
/// An entry whose `ended` token is cancelled counts as absent: its relay has
/// already handed `end` to the client and the session has not reaped it yet.
///
/// Owned by exactly one session; never shared across connections.
#[derive(Debug, Default)]
pub struct ActiveJobs {
    entries: HashMap<CorrelationId, Entry>,
}

impl ActiveJobs {
    pub fn insert(&mut self, id: CorrelationId, relay: AbortHandle, ended: CancellationToken) {
        self.entries.insert(id, Entry { relay, ended });
    }

    /// Whether `id` is registered and its `end` has not been relayed.
    pub fn is_live(&self, id: &CorrelationId) -> bool {
        self.entries
            .get(id)
            .is_some_and(|entry| !entry.ended.is_cancelled())
    }

    /// Removes `id`, returning whether it was registered.
    pub fn remove(&mut self, id: &CorrelationId) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Empties the registry and aborts every relay. Returns the jobs that
    /// had not ended.
    pub fn drain_live(&mut self) -> Vec<CorrelationId> {
        self.entries
            .drain()
            .filter_map(|(id, entry)| {
                entry.relay.abort();
                (!entry.ended.is_cancelled()).then_some(id)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ended_entries_count_as_absent() {
        let mut jobs = ActiveJobs::default();
        let relay = tokio::spawn(std::future::pending::<()>());
        let ended = CancellationToken::new();
        jobs.insert("a".into(), relay.abort_handle(), ended.clone());
        assert!(jobs.is_live(&"a".into()));

        ended.cancel();
        assert!(!jobs.is_live(&"a".into()));
        assert!(jobs.drain_live().is_empty());
        assert!(relay.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn drain_returns_live_jobs_and_aborts_relays() {
        let mut jobs = ActiveJobs::default();
        let relay = tokio::spawn(std::future::pending::<()>());
        jobs.insert("a".into(), relay.abort_handle(), CancellationToken::new());

        assert_eq!(jobs.drain_live(), vec![CorrelationId::from("a")]);
        assert!(!jobs.is_live(&"a".into()));
        assert!(relay.await.unwrap_err().is_cancelled());
    }
}
