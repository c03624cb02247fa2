use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};

use crate::raft::LogEntry;
use crate::state::{ApplyOutcome, ClusterState};

/// Non-`Applied` outcomes remembered for writers waiting on their index.
const MAX_TRACKED_OUTCOMES: usize = 4096;

/// Shared handle to the applied cluster state.
///
/// Readers take an `Arc` snapshot and never block the apply loop for longer
/// than the pointer swap. The apply loop is the only writer.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<RwLock<Arc<ClusterState>>>,
    outcomes: Arc<RwLock<BTreeMap<u64, ApplyOutcome>>>,
    index_tx: Arc<watch::Sender<u64>>,
}

impl StateStore {
    pub fn new() -> Self {
        let (index_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(RwLock::new(Arc::new(ClusterState::new()))),
            outcomes: Arc::new(RwLock::new(BTreeMap::new())),
            index_tx: Arc::new(index_tx),
        }
    }

    /// Point-in-time view of the state.
    pub async fn snapshot(&self) -> Arc<ClusterState> {
        self.inner.read().await.clone()
    }

    pub fn applied_index(&self) -> u64 {
        *self.index_tx.borrow()
    }

    /// Receiver notified whenever the applied index advances.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.index_tx.subscribe()
    }

    /// Apply committed entries in index order and publish the new view.
    pub async fn apply_entries(&self, entries: &[LogEntry]) -> Vec<(u64, ApplyOutcome)> {
        if entries.is_empty() {
            return Vec::new();
        }

        let mut guard = self.inner.write().await;
        let state = Arc::make_mut(&mut *guard);
        let mut outcomes = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.index <= state.last_applied {
                continue;
            }
            let outcome = state.apply(entry.index, entry.request_id.as_deref(), &entry.command);
            match &outcome {
                ApplyOutcome::Applied => {
                    tracing::debug!(index = entry.index, command = entry.command.name(), "Applied entry");
                }
                ApplyOutcome::Duplicate { first_index } => {
                    tracing::debug!(
                        index = entry.index,
                        first_index,
                        request_id = entry.request_id.as_deref().unwrap_or_default(),
                        "Skipped duplicate request"
                    );
                }
                ApplyOutcome::Rejected(reason) => {
                    tracing::debug!(
                        index = entry.index,
                        command = entry.command.name(),
                        %reason,
                        "Rejected entry"
                    );
                }
            }
            outcomes.push((entry.index, outcome));
        }
        let applied = state.last_applied;
        drop(guard);

        let mut recorded = self.outcomes.write().await;
        for (index, outcome) in &outcomes {
            if *outcome != ApplyOutcome::Applied {
                recorded.insert(*index, outcome.clone());
            }
        }
        while recorded.len() > MAX_TRACKED_OUTCOMES {
            recorded.pop_first();
        }
        drop(recorded);

        self.index_tx.send_replace(applied);
        outcomes
    }

    /// Replace the whole state, e.g. from a snapshot.
    pub async fn restore(&self, state: ClusterState) {
        let applied = state.last_applied;
        *self.inner.write().await = Arc::new(state);
        self.index_tx.send_replace(applied);
    }

    /// Wait until the applied index reaches `min_index` or `timeout` elapses.
    ///
    /// Returns whether the index was reached together with the state at return time.
    pub async fn wait_for_index(&self, min_index: u64, timeout: Duration) -> (bool, Arc<ClusterState>) {
        let mut rx = self.subscribe();
        let reached = tokio::time::timeout(timeout, rx.wait_for(|index| *index >= min_index))
            .await
            .map(|res| res.is_ok())
            .unwrap_or(false);
        (reached, self.snapshot().await)
    }

    /// Wait for `index` to apply and report what it did.
    ///
    /// `None` means the index was not applied within `timeout`. Entries that
    /// arrived through a snapshot restore report `Applied`.
    pub async fn wait_for_outcome(&self, index: u64, timeout: Duration) -> Option<ApplyOutcome> {
        let (reached, _) = self.wait_for_index(index, timeout).await;
        if !reached {
            return None;
        }
        Some(
            self.outcomes
                .read()
                .await
                .get(&index)
                .cloned()
                .unwrap_or(ApplyOutcome::Applied),
        )
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Command, Rejection};

    fn noop(index: u64) -> LogEntry {
        LogEntry {
            term: 1,
            index,
            request_id: None,
            command: Command::Noop,
        }
    }

    #[tokio::test]
    async fn test_readers_keep_their_snapshot() {
        let store = StateStore::new();
        let before = store.snapshot().await;
        store.apply_entries(&[noop(1), noop(2)]).await;

        assert_eq!(before.last_applied, 0);
        assert_eq!(store.snapshot().await.last_applied, 2);
        assert_eq!(store.applied_index(), 2);
    }

    #[tokio::test]
    async fn test_already_applied_entries_are_skipped() {
        let store = StateStore::new();
        store.apply_entries(&[noop(1), noop(2)]).await;
        let outcomes = store.apply_entries(&[noop(2), noop(3)]).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].0, 3);
    }

    #[tokio::test]
    async fn test_wait_for_index_wakes_on_apply() {
        let store = StateStore::new();
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_for_index(3, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.apply_entries(&[noop(1), noop(2), noop(3)]).await;

        let (reached, state) = waiter.await.unwrap();
        assert!(reached);
        assert_eq!(state.last_applied, 3);
    }

    #[tokio::test]
    async fn test_wait_for_index_times_out() {
        let store = StateStore::new();
        let (reached, state) = store.wait_for_index(5, Duration::from_millis(30)).await;
        assert!(!reached);
        assert_eq!(state.last_applied, 0);
    }

    #[tokio::test]
    async fn test_rejected_entry_reports_its_reason() {
        let store = StateStore::new();
        let stop_missing = LogEntry {
            term: 1,
            index: 2,
            request_id: Some("req-1".into()),
            command: Command::StopJob {
                job_id: "ghost".into(),
                at_ms: 0,
            },
        };
        store.apply_entries(&[noop(1), stop_missing]).await;

        assert_eq!(
            store.wait_for_outcome(1, Duration::from_millis(30)).await,
            Some(ApplyOutcome::Applied)
        );
        assert_eq!(
            store.wait_for_outcome(2, Duration::from_millis(30)).await,
            Some(ApplyOutcome::Rejected(Rejection::UnknownJob("ghost".into())))
        );
        assert_eq!(store.wait_for_outcome(3, Duration::from_millis(30)).await, None);
    }
}
