//! Snapshot creation, installation and the consistent read used to ship one.

use super::engine::EngineInner;
use super::rpc::InstallSnapshotRequest;
use crate::error::{RaftError, Result};
use crate::observability;
use crate::storage::LogStore;
use crate::types::{LogIndex, Term};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Attempts at reading a snapshot while compaction keeps moving the boundary.
const READ_ATTEMPTS: usize = 3;

/// A stored snapshot together with the boundary it covers.
#[derive(Debug, Clone)]
pub(crate) struct SnapshotImage {
    pub(crate) index: LogIndex,
    pub(crate) term: Term,
    pub(crate) data: Vec<u8>,
}

/// Read the stored snapshot and its boundary as one consistent image.
///
/// The boundary only moves forward, so an unchanged index after reading the
/// data means no compaction happened in between.
pub(crate) async fn read_snapshot(log: &dyn LogStore) -> Result<Option<SnapshotImage>> {
    for _ in 0..READ_ATTEMPTS {
        let index = log.last_snapshot_index();
        if index == 0 {
            return Ok(None);
        }
        let term = log.last_snapshot_term();
        let Some(data) = log.snapshot_data().await? else {
            return Ok(None);
        };
        if log.last_snapshot_index() == index {
            return Ok(Some(SnapshotImage { index, term, data }));
        }
        debug!(index, "Snapshot replaced while reading, retrying");
    }
    Err(RaftError::Snapshot(
        "Snapshot kept changing while being read".to_string(),
    ))
}

impl EngineInner {
    /// Install a snapshot received from the leader.
    ///
    /// Returns `Ok(false)` when the snapshot is not newer than what this
    /// node already holds or has applied. The caller holds the role lock.
    pub(crate) async fn install_snapshot(&self, request: InstallSnapshotRequest) -> Result<bool> {
        let boundary = request.last_included_index;
        let boundary_term = request.last_included_term;
        if self.snapshot_is_stale(boundary) {
            debug!(
                node_id = self.node_id(),
                last_included_index = boundary,
                last_applied = self.last_applied(),
                "Ignoring snapshot that is not newer than local state"
            );
            return Ok(false);
        }

        let _gate = self.apply_gate.lock().await;
        if self.snapshot_is_stale(boundary) {
            return Ok(false);
        }

        // A failed restore leaves the log and indices untouched.
        self.state_machine.restore_from_snapshot(&request.data).await?;

        // A matching entry at the boundary means the suffix agrees with the
        // leader and stays. Otherwise the whole retained log is discarded.
        let keep_log = self.log.term_at(boundary)? == Some(boundary_term);
        if !keep_log {
            let from = self.log.last_snapshot_index() + 1;
            if from <= self.log.last_index() {
                warn!(
                    node_id = self.node_id(),
                    from,
                    last_included_index = boundary,
                    "Discarding log that conflicts with the leader's snapshot"
                );
                self.log.truncate(from).await?;
                self.fail_proposals_from(from);
            }
        }
        self.log.compact_log(request.data, boundary, boundary_term).await?;

        if self.commit_index.fetch_max(boundary, Ordering::SeqCst) < boundary {
            observability::record_commit(self.node_id(), boundary);
        }
        self.last_applied.fetch_max(boundary, Ordering::SeqCst);
        self.fail_proposals_through(boundary);
        observability::record_snapshot(self.node_id(), boundary);
        // Entries past the boundary may already be committed.
        self.apply_notify.notify_one();

        Ok(true)
    }

    fn snapshot_is_stale(&self, boundary: LogIndex) -> bool {
        boundary <= self.log.last_snapshot_index() || boundary <= self.last_applied()
    }

    /// Snapshot the state machine at `last_applied` and compact the log.
    ///
    /// Holds the role lock throughout so that no truncation or snapshot
    /// install from the command loop can interleave with the compaction.
    pub(crate) async fn take_snapshot(&self) -> Result<Option<LogIndex>> {
        let _role = self.role.lock().await;

        let (index, data) = {
            let _gate = self.apply_gate.lock().await;
            let index = self.last_applied();
            if index <= self.log.last_snapshot_index() {
                return Ok(None);
            }
            (index, self.state_machine.create_snapshot().await?)
        };

        let term = self.log.term_at(index)?.ok_or_else(|| {
            RaftError::Snapshot(format!("No term known for applied index {}", index))
        })?;
        let bytes = data.len();
        self.log.compact_log(data, index, term).await?;

        self.snapshots_taken.fetch_add(1, Ordering::SeqCst);
        observability::record_snapshot(self.node_id(), index);
        info!(
            node_id = self.node_id(),
            last_included_index = index,
            last_included_term = term,
            bytes,
            retained = self.log.last_index() - index,
            "Compacted log into snapshot"
        );
        Ok(Some(index))
    }

    /// Start a background compaction once enough entries have been applied
    /// past the last snapshot. At most one runs at a time.
    pub(crate) fn maybe_trigger_snapshot(self: &Arc<Self>) {
        if self.shutdown.is_triggered() {
            return;
        }
        let since_snapshot = self
            .last_applied()
            .saturating_sub(self.log.last_snapshot_index());
        if since_snapshot < self.config.snapshot_threshold {
            return;
        }
        if self.snapshot_in_progress.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!(
            node_id = self.node_id(),
            since_snapshot,
            threshold = self.config.snapshot_threshold,
            "Snapshot threshold reached"
        );
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = inner.take_snapshot().await {
                error!(
                    node_id = inner.node_id(),
                    critical = true,
                    error = %e,
                    "Snapshot failed"
                );
            }
            inner.snapshot_in_progress.store(false, Ordering::SeqCst);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::LogEntry;
    use crate::storage::MemoryStore;

    #[tokio::test]
    async fn test_read_snapshot_empty_store() {
        let store = MemoryStore::new();
        assert!(read_snapshot(&store).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_snapshot_returns_boundary_and_data() {
        let store = MemoryStore::new();
        for i in 1..=4 {
            store.append(LogEntry::new(2, i, vec![i as u8])).await.unwrap();
        }
        store.compact_log(b"state".to_vec(), 3, 2).await.unwrap();

        let image = read_snapshot(&store).await.unwrap().unwrap();
        assert_eq!(image.index, 3);
        assert_eq!(image.term, 2);
        assert_eq!(image.data, b"state".to_vec());
    }
}
