//! Follower: votes, accepts entries and snapshots from the leader.

use super::timer::ElectionTimer;
use crate::config::RaftConfig;
use crate::raft::command::Command;
use crate::raft::engine::EngineInner;
use crate::raft::is_up_to_date;
use crate::raft::rpc::*;
use crate::shutdown::ShutdownSignal;
use crate::types::{LogIndex, Term};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub(crate) struct Follower {
    pub(super) epoch: u64,
    pub(super) signal: ShutdownSignal,
    timer: ElectionTimer,
}

impl Follower {
    pub(super) fn new(config: &RaftConfig, epoch: u64, signal: ShutdownSignal) -> Self {
        Self {
            epoch,
            signal,
            timer: ElectionTimer::new(config.election_timeout_min, config.election_timeout_max),
        }
    }

    /// Arm the election timer.
    pub(super) fn start(&self, inner: &Arc<EngineInner>) {
        let engine = Arc::clone(inner);
        let epoch = self.epoch;
        self.timer.spawn(self.signal.clone(), move || {
            debug!(node_id = engine.node_id(), epoch, "Election timer expired");
            engine.try_enqueue(Command::Timeout { epoch: Some(epoch) });
        });
    }

    pub(super) async fn handle_request_vote(
        &mut self,
        inner: &Arc<EngineInner>,
        request: RequestVoteRequest,
    ) -> RequestVoteResponse {
        let term = inner.state.current_term();
        let voted_for = inner.state.voted_for();
        let free_to_vote = voted_for.is_none() || voted_for == Some(request.candidate_id);
        let log_ok = is_up_to_date(
            inner.log.last_entry_info(),
            request.last_log_index,
            request.last_log_term,
        );

        let vote_granted = if !free_to_vote || !log_ok {
            false
        } else if let Err(e) = inner.state.set_voted_for(Some(request.candidate_id)).await {
            error!(
                node_id = inner.node_id(),
                critical = true,
                candidate = request.candidate_id,
                error = %e,
                "Failed to persist vote"
            );
            false
        } else {
            self.timer.reset();
            true
        };

        debug!(
            node_id = inner.node_id(),
            candidate = request.candidate_id,
            term,
            voted_for = ?voted_for,
            log_ok,
            vote_granted,
            "Handled RequestVote"
        );

        if vote_granted {
            RequestVoteResponse::granted(term)
        } else {
            RequestVoteResponse::denied(term)
        }
    }

    pub(super) async fn handle_append_entries(
        &mut self,
        inner: &Arc<EngineInner>,
        request: AppendEntriesRequest,
    ) -> AppendEntriesResponse {
        let term = inner.state.current_term();
        inner.set_leader(Some(request.leader_id));
        self.timer.reset();

        let log = &inner.log;
        let last_index = log.last_index();
        let snapshot_index = log.last_snapshot_index();

        // Log consistency check. Anything at or below our snapshot is committed
        // and therefore matches.
        if request.prev_log_index > last_index {
            debug!(
                node_id = inner.node_id(),
                prev_log_index = request.prev_log_index,
                last_index,
                "AppendEntries beyond end of log"
            );
            return AppendEntriesResponse::rejected(term, Some(last_index + 1));
        }
        if request.prev_log_index > snapshot_index {
            match log.term_at(request.prev_log_index) {
                Ok(Some(prev_term)) if prev_term == request.prev_log_term => {}
                Ok(Some(prev_term)) => {
                    let conflict_index =
                        first_index_of_term(inner, prev_term, request.prev_log_index, snapshot_index);
                    debug!(
                        node_id = inner.node_id(),
                        prev_log_index = request.prev_log_index,
                        expected_term = request.prev_log_term,
                        actual_term = prev_term,
                        conflict_index,
                        "AppendEntries log mismatch"
                    );
                    return AppendEntriesResponse::rejected(term, Some(conflict_index));
                }
                Ok(None) => {
                    return AppendEntriesResponse::rejected(term, Some(snapshot_index + 1));
                }
                Err(e) => {
                    error!(node_id = inner.node_id(), critical = true, error = %e, "Failed to read log");
                    return AppendEntriesResponse::rejected(term, None);
                }
            }
        }

        // Skip entries we already hold; truncate at the first conflict.
        let last_new_index = request.prev_log_index + request.entries.len() as u64;
        let mut append_from = None;
        for (offset, entry) in request.entries.iter().enumerate() {
            if entry.index <= snapshot_index {
                continue;
            }
            if entry.index > log.last_index() {
                append_from = Some(offset);
                break;
            }
            match log.term_at(entry.index) {
                Ok(Some(existing)) if existing == entry.term => continue,
                Ok(_) => {
                    if entry.index <= inner.commit_index() {
                        error!(
                            node_id = inner.node_id(),
                            critical = true,
                            index = entry.index,
                            commit_index = inner.commit_index(),
                            "Leader sent an entry conflicting with a committed one"
                        );
                        return AppendEntriesResponse::rejected(term, None);
                    }
                    warn!(
                        node_id = inner.node_id(),
                        index = entry.index,
                        term = entry.term,
                        "Truncating conflicting log suffix"
                    );
                    if let Err(e) = log.truncate(entry.index).await {
                        error!(node_id = inner.node_id(), critical = true, error = %e, "Failed to truncate log");
                        return AppendEntriesResponse::rejected(term, None);
                    }
                    inner.fail_proposals_from(entry.index);
                    append_from = Some(offset);
                    break;
                }
                Err(e) => {
                    error!(node_id = inner.node_id(), critical = true, error = %e, "Failed to read log");
                    return AppendEntriesResponse::rejected(term, None);
                }
            }
        }

        if let Some(offset) = append_from {
            let mut entries = request.entries;
            let new_entries = entries.split_off(offset);
            let count = new_entries.len();
            if let Err(e) = log.append_entries(new_entries).await {
                error!(
                    node_id = inner.node_id(),
                    critical = true,
                    entry_count = count,
                    error = %e,
                    "Failed to persist log entries, leader will retry"
                );
                return AppendEntriesResponse::rejected(term, None);
            }
            debug!(
                node_id = inner.node_id(),
                entry_count = count,
                last_index = log.last_index(),
                "Appended entries"
            );
        }

        if request.leader_commit > inner.commit_index() {
            inner.set_commit_index(request.leader_commit.min(last_new_index));
        }

        AppendEntriesResponse::accepted(term)
    }

    pub(super) async fn handle_install_snapshot(
        &mut self,
        inner: &Arc<EngineInner>,
        request: InstallSnapshotRequest,
    ) -> InstallSnapshotResponse {
        let term = inner.state.current_term();
        inner.set_leader(Some(request.leader_id));
        self.timer.reset();

        let last_included_index = request.last_included_index;
        let success = match inner.install_snapshot(request).await {
            Ok(true) => {
                info!(
                    node_id = inner.node_id(),
                    last_included_index,
                    "Installed snapshot from leader"
                );
                true
            }
            Ok(false) => true,
            Err(e) => {
                error!(
                    node_id = inner.node_id(),
                    critical = true,
                    last_included_index,
                    error = %e,
                    "Failed to install snapshot"
                );
                false
            }
        };

        // Installing can take a while; don't time out right after.
        self.timer.reset();
        InstallSnapshotResponse { term, success }
    }
}

/// First index of the run of `term` ending at `from`, never below the snapshot.
fn first_index_of_term(
    inner: &EngineInner,
    term: Term,
    from: LogIndex,
    snapshot_index: LogIndex,
) -> LogIndex {
    let mut index = from;
    while index > snapshot_index + 1 {
        match inner.log.term_at(index - 1) {
            Ok(Some(t)) if t == term => index -= 1,
            _ => break,
        }
    }
    index
}
