//! Apply loop: feeds committed entries to the state machine in log order.

use super::engine::EngineInner;
use crate::error::RaftError;
use crate::observability;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, error, warn};

impl EngineInner {
    /// Wait for the commit index to move and apply everything up to it.
    ///
    /// A storage or state machine failure stalls the loop; it retries every
    /// heartbeat interval until the entry goes through.
    pub(crate) async fn run_apply_loop(self: Arc<Self>) {
        debug!(node_id = self.node_id(), "Apply loop started");
        let mut stalled = false;
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = self.apply_notify.notified() => {}
                _ = sleep(self.config.heartbeat_interval), if stalled => {}
            }
            stalled = !self.apply_committed().await;
            self.maybe_trigger_snapshot();
        }
        debug!(node_id = self.node_id(), "Apply loop stopped");
    }

    /// Apply entries in `(last_applied, commit_index]`. Returns false if an
    /// entry could not be read or applied and the remainder must be retried.
    pub(crate) async fn apply_committed(&self) -> bool {
        let _gate = self.apply_gate.lock().await;

        while self.last_applied() < self.commit_index() {
            if self.shutdown.is_triggered() {
                return true;
            }
            let index = self.last_applied() + 1;
            let entry = match self.log.get(index) {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    // Covered by a snapshot installed underneath us.
                    let boundary = self.log.last_snapshot_index();
                    if boundary >= index {
                        self.last_applied.fetch_max(boundary, Ordering::SeqCst);
                        continue;
                    }
                    error!(
                        node_id = self.node_id(),
                        critical = true,
                        index,
                        commit_index = self.commit_index(),
                        "Committed entry missing from the log"
                    );
                    return false;
                }
                Err(e) => {
                    error!(
                        node_id = self.node_id(),
                        critical = true,
                        index,
                        error = %e,
                        "Failed to read committed entry"
                    );
                    return false;
                }
            };

            let result = match self.state_machine.apply(entry.command_bytes()).await {
                Err(RaftError::StateMachine(reason)) => {
                    warn!(
                        node_id = self.node_id(),
                        index,
                        term = entry.term,
                        reason = %reason,
                        "State machine rejected command"
                    );
                    Err(RaftError::StateMachine(reason))
                }
                Err(e) => {
                    error!(
                        node_id = self.node_id(),
                        critical = true,
                        index,
                        term = entry.term,
                        error = %e,
                        "State machine failed to apply entry, will retry"
                    );
                    return false;
                }
                Ok(output) => Ok(output),
            };

            self.last_applied.store(index, Ordering::SeqCst);
            observability::record_applied(self.node_id(), index);
            self.resolve_proposal(index, result);
        }
        true
    }
}
