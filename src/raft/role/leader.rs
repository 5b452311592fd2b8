//! Leader: accepts proposals, replicates the log and advances the commit index.

use super::timer::spawn_ticker;
use crate::observability;
use crate::raft::command::{Command, ProposalReply};
use crate::raft::engine::EngineInner;
use crate::raft::rpc::*;
use crate::raft::snapshot::read_snapshot;
use crate::raft::state::{next_commit_index, quorum_size, ReplicationProgress};
use crate::raft::LogEntry;
use crate::shutdown::ShutdownSignal;
use crate::types::{LogIndex, NodeId, Term};
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, error, info};

pub(crate) struct Leader {
    pub(super) epoch: u64,
    pub(super) signal: ShutdownSignal,
    term: Term,
    progress: ReplicationProgress,
}

impl Leader {
    pub(super) fn enter(inner: &Arc<EngineInner>, epoch: u64, signal: ShutdownSignal) -> Self {
        let term = inner.state.current_term();
        let last_index = inner.log.last_index();
        inner.set_leader(Some(inner.node_id()));

        let mut leader = Self {
            epoch,
            signal,
            term,
            progress: ReplicationProgress::new(&inner.config.peers, last_index),
        };

        info!(
            node_id = inner.node_id(),
            term,
            last_index,
            "Became leader"
        );

        let engine = Arc::clone(inner);
        spawn_ticker(
            inner.config.heartbeat_interval,
            leader.signal.clone(),
            move || engine.try_enqueue(Command::Heartbeat { epoch }),
        );

        // Announce leadership right away.
        leader.replicate_all(inner);
        leader.advance_commit(inner);
        leader
    }

    pub(super) async fn propose(
        &mut self,
        inner: &Arc<EngineInner>,
        command: Vec<u8>,
        reply: ProposalReply,
    ) {
        let index = inner.log.last_index() + 1;
        let entry = LogEntry::new(self.term, index, command);
        if let Err(e) = inner.log.append(entry).await {
            error!(
                node_id = inner.node_id(),
                critical = true,
                index,
                error = %e,
                "Failed to append proposal"
            );
            let _ = reply.send(Err(e));
            return;
        }

        debug!(node_id = inner.node_id(), index, term = self.term, "Appended proposal");
        observability::record_proposal(inner.node_id());
        inner.register_proposal(index, reply);

        self.replicate_all(inner);
        self.advance_commit(inner);
    }

    /// Send the next batch (or a heartbeat) to every peer without an outstanding request.
    pub(super) fn replicate_all(&mut self, inner: &Arc<EngineInner>) {
        for &peer in &inner.config.peers {
            self.replicate_to(inner, peer);
        }
    }

    fn replicate_to(&mut self, inner: &Arc<EngineInner>, peer: NodeId) {
        if self.progress.is_in_flight(peer) {
            return;
        }

        let log = &inner.log;
        let next_index = self.progress.next_for(peer);
        if next_index <= log.last_snapshot_index() {
            self.send_snapshot(inner, peer);
            return;
        }

        let prev_log_index = next_index - 1;
        let prev_log_term = match log.term_at(prev_log_index) {
            Ok(Some(term)) => term,
            // Compacted away since we looked at the boundary.
            Ok(None) => {
                self.send_snapshot(inner, peer);
                return;
            }
            Err(e) => {
                error!(node_id = inner.node_id(), critical = true, peer, error = %e, "Failed to read log");
                return;
            }
        };

        let batch_end = next_index
            .saturating_add(inner.config.max_entries_per_append as u64 - 1)
            .min(log.last_index());
        let entries = match log.entries(next_index, batch_end) {
            Ok(entries) => entries,
            Err(e) => {
                error!(node_id = inner.node_id(), critical = true, peer, error = %e, "Failed to read log");
                return;
            }
        };

        let request = AppendEntriesRequest {
            term: self.term,
            leader_id: inner.node_id(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: inner.commit_index(),
        };
        self.progress.begin_request(peer);
        self.spawn_append(inner, peer, request);
    }

    fn spawn_append(&self, inner: &Arc<EngineInner>, peer: NodeId, request: AppendEntriesRequest) {
        let engine = Arc::clone(inner);
        let signal = self.signal.clone();
        let epoch = self.epoch;
        let term = self.term;
        let rpc_timeout = inner.config.rpc_timeout;
        let prev_log_index = request.prev_log_index;
        let entry_count = request.entries.len() as u64;

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = signal.cancelled() => return,
                result = timeout(rpc_timeout, engine.cluster.append_entries(peer, request)) => result,
            };
            let response = match result {
                Ok(Ok(response)) => Some(response),
                Ok(Err(e)) => {
                    debug!(node_id = engine.node_id(), peer, error = %e, "AppendEntries failed");
                    None
                }
                Err(_) => {
                    debug!(node_id = engine.node_id(), peer, "AppendEntries timed out");
                    None
                }
            };
            if let Some(response) = &response {
                if response.term > term {
                    engine.process_higher_term(peer, response.term);
                    return;
                }
            }
            engine.try_enqueue(Command::ReplicationResult {
                epoch,
                peer,
                prev_log_index,
                entry_count,
                response,
            });
        });
    }

    /// Ship the stored snapshot to a peer that needs compacted entries.
    fn send_snapshot(&mut self, inner: &Arc<EngineInner>, peer: NodeId) {
        self.progress.begin_request(peer);

        let engine = Arc::clone(inner);
        let signal = self.signal.clone();
        let epoch = self.epoch;
        let term = self.term;
        let rpc_timeout = inner.config.snapshot_rpc_timeout;

        tokio::spawn(async move {
            let image = match read_snapshot(engine.log.as_ref()).await {
                Ok(Some(image)) => image,
                Ok(None) => {
                    error!(node_id = engine.node_id(), critical = true, peer, "No snapshot to send");
                    engine.try_enqueue(Command::SnapshotResult {
                        epoch,
                        peer,
                        last_included_index: 0,
                        response: None,
                    });
                    return;
                }
                Err(e) => {
                    error!(node_id = engine.node_id(), critical = true, peer, error = %e, "Failed to read snapshot");
                    engine.try_enqueue(Command::SnapshotResult {
                        epoch,
                        peer,
                        last_included_index: 0,
                        response: None,
                    });
                    return;
                }
            };

            let last_included_index = image.index;
            info!(
                node_id = engine.node_id(),
                peer,
                last_included_index,
                bytes = image.data.len(),
                "Sending snapshot to lagging peer"
            );
            let request = InstallSnapshotRequest {
                term,
                leader_id: engine.node_id(),
                last_included_index,
                last_included_term: image.term,
                data: image.data,
            };

            let result = tokio::select! {
                _ = signal.cancelled() => return,
                result = timeout(rpc_timeout, engine.cluster.install_snapshot(peer, request)) => result,
            };
            let response = match result {
                Ok(Ok(response)) => Some(response),
                Ok(Err(e)) => {
                    debug!(node_id = engine.node_id(), peer, error = %e, "InstallSnapshot failed");
                    None
                }
                Err(_) => {
                    debug!(node_id = engine.node_id(), peer, "InstallSnapshot timed out");
                    None
                }
            };
            if let Some(response) = &response {
                if response.term > term {
                    engine.process_higher_term(peer, response.term);
                    return;
                }
            }
            engine.try_enqueue(Command::SnapshotResult {
                epoch,
                peer,
                last_included_index,
                response,
            });
        });
    }

    pub(super) fn on_replication_result(
        &mut self,
        inner: &Arc<EngineInner>,
        peer: NodeId,
        prev_log_index: LogIndex,
        entry_count: u64,
        response: Option<AppendEntriesResponse>,
    ) {
        self.progress.finish_request(peer);
        // Unreachable peers are retried on the next heartbeat.
        let Some(response) = response else {
            return;
        };

        if response.success {
            self.progress.update_match(peer, prev_log_index + entry_count);
            self.advance_commit(inner);
            if self.progress.next_for(peer) <= inner.log.last_index() {
                self.replicate_to(inner, peer);
            }
        } else {
            debug!(
                node_id = inner.node_id(),
                peer,
                prev_log_index,
                conflict_index = ?response.conflict_index,
                "Peer rejected entries, backing off"
            );
            self.progress.back_off(peer, response.conflict_index);
            self.replicate_to(inner, peer);
        }
    }

    pub(super) fn on_snapshot_result(
        &mut self,
        inner: &Arc<EngineInner>,
        peer: NodeId,
        last_included_index: LogIndex,
        response: Option<InstallSnapshotResponse>,
    ) {
        self.progress.finish_request(peer);
        match response {
            Some(response) if response.success => {
                debug!(node_id = inner.node_id(), peer, last_included_index, "Peer installed snapshot");
                self.progress.update_match(peer, last_included_index);
                self.advance_commit(inner);
                if self.progress.next_for(peer) <= inner.log.last_index() {
                    self.replicate_to(inner, peer);
                }
            }
            _ => {}
        }
    }

    /// Commit the highest index held by a majority, if it is from our term.
    fn advance_commit(&self, inner: &EngineInner) {
        let quorum = quorum_size(inner.config.cluster_size());
        let log = &inner.log;
        let candidate = next_commit_index(
            &self.progress,
            log.last_index(),
            quorum,
            inner.commit_index(),
            self.term,
            |index| log.term_at(index).ok().flatten(),
        );
        if let Some(index) = candidate {
            inner.set_commit_index(index);
        }
    }
}
