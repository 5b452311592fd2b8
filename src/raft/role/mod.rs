//! Follower, Candidate and Leader behaviour.
//!
//! [`Role`] is a closed enum; the engine dispatches every event through it.
//! Checks shared by all roles (stale terms, not-leader proposals) live
//! here, the role-specific handling in the submodules.

mod candidate;
mod follower;
mod leader;
pub(crate) mod timer;

use super::command::ProposalReply;
use super::engine::EngineInner;
use super::rpc::*;
use super::NodeState;
use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::shutdown::ShutdownSignal;
use crate::types::{LogIndex, NodeId};
use candidate::Candidate;
use follower::Follower;
use leader::Leader;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of an RPC handler.
pub(crate) enum Handled<R, T> {
    /// The role answered.
    Done(T),
    /// The role must give way to a Follower, which should see the request.
    Defer(R),
}

pub(crate) enum Role {
    Follower(Follower),
    Candidate(Candidate),
    Leader(Leader),
}

impl Role {
    /// Placeholder held before the engine starts. Runs no timer.
    pub(crate) fn initial(config: &RaftConfig, signal: ShutdownSignal) -> Self {
        Role::Follower(Follower::new(config, 0, signal))
    }

    /// A running Follower for `epoch`.
    pub(crate) fn follower(inner: &Arc<EngineInner>, epoch: u64) -> Self {
        let follower = Follower::new(&inner.config, epoch, inner.shutdown.child());
        follower.start(inner);
        Role::Follower(follower)
    }

    /// Enter `target`. May ask for an immediate follow-up transition
    /// (a Candidate that already holds a majority becomes Leader).
    pub(crate) async fn enter(
        inner: &Arc<EngineInner>,
        target: NodeState,
        epoch: u64,
    ) -> Result<(Role, Option<NodeState>)> {
        match target {
            NodeState::Follower => Ok((Role::follower(inner, epoch), None)),
            NodeState::Candidate => {
                let (candidate, won) =
                    Candidate::enter(inner, epoch, inner.shutdown.child()).await?;
                let follow_up = if won { Some(NodeState::Leader) } else { None };
                Ok((Role::Candidate(candidate), follow_up))
            }
            NodeState::Leader => Ok((
                Role::Leader(Leader::enter(inner, epoch, inner.shutdown.child())),
                None,
            )),
        }
    }

    /// Stop this role's timers and in-flight RPCs.
    pub(crate) fn leave(&mut self) {
        match self {
            Role::Follower(f) => f.signal.trigger(),
            Role::Candidate(c) => c.signal.trigger(),
            Role::Leader(l) => l.signal.trigger(),
        }
    }

    pub(crate) fn state(&self) -> NodeState {
        match self {
            Role::Follower(_) => NodeState::Follower,
            Role::Candidate(_) => NodeState::Candidate,
            Role::Leader(_) => NodeState::Leader,
        }
    }

    pub(crate) fn epoch(&self) -> u64 {
        match self {
            Role::Follower(f) => f.epoch,
            Role::Candidate(c) => c.epoch,
            Role::Leader(l) => l.epoch,
        }
    }

    pub(crate) async fn handle_request_vote(
        &mut self,
        inner: &Arc<EngineInner>,
        request: RequestVoteRequest,
    ) -> RequestVoteResponse {
        let term = inner.state.current_term();
        if request.term < term {
            debug!(
                node_id = inner.node_id(),
                candidate = request.candidate_id,
                request_term = request.term,
                term,
                "Rejecting RequestVote from stale term"
            );
            return RequestVoteResponse::denied(term);
        }

        match self {
            Role::Follower(follower) => follower.handle_request_vote(inner, request).await,
            // Both voted for themselves in this term.
            Role::Candidate(_) | Role::Leader(_) => RequestVoteResponse::denied(term),
        }
    }

    pub(crate) async fn handle_append_entries(
        &mut self,
        inner: &Arc<EngineInner>,
        request: AppendEntriesRequest,
    ) -> Handled<AppendEntriesRequest, AppendEntriesResponse> {
        let term = inner.state.current_term();
        if request.term < term {
            debug!(
                node_id = inner.node_id(),
                leader = request.leader_id,
                request_term = request.term,
                term,
                "Rejecting AppendEntries from stale term"
            );
            return Handled::Done(AppendEntriesResponse::rejected(term, None));
        }

        match self {
            Role::Follower(follower) => {
                Handled::Done(follower.handle_append_entries(inner, request).await)
            }
            Role::Candidate(_) => Handled::Defer(request),
            Role::Leader(_) => {
                warn!(
                    node_id = inner.node_id(),
                    other = request.leader_id,
                    term,
                    "Another leader claims the current term"
                );
                Handled::Done(AppendEntriesResponse::rejected(term, None))
            }
        }
    }

    pub(crate) async fn handle_install_snapshot(
        &mut self,
        inner: &Arc<EngineInner>,
        request: InstallSnapshotRequest,
    ) -> Handled<InstallSnapshotRequest, InstallSnapshotResponse> {
        let term = inner.state.current_term();
        if request.term < term {
            debug!(
                node_id = inner.node_id(),
                leader = request.leader_id,
                request_term = request.term,
                term,
                "Rejecting InstallSnapshot from stale term"
            );
            return Handled::Done(InstallSnapshotResponse {
                term,
                success: false,
            });
        }

        match self {
            Role::Follower(follower) => {
                Handled::Done(follower.handle_install_snapshot(inner, request).await)
            }
            Role::Candidate(_) => Handled::Defer(request),
            Role::Leader(_) => {
                warn!(
                    node_id = inner.node_id(),
                    other = request.leader_id,
                    term,
                    "Another leader sent a snapshot in the current term"
                );
                Handled::Done(InstallSnapshotResponse {
                    term,
                    success: false,
                })
            }
        }
    }

    pub(crate) async fn propose(
        &mut self,
        inner: &Arc<EngineInner>,
        command: Vec<u8>,
        reply: ProposalReply,
    ) {
        match self {
            Role::Leader(leader) => leader.propose(inner, command, reply).await,
            _ => {
                let _ = reply.send(Err(RaftError::NotLeader {
                    leader: inner.leader_id(),
                }));
            }
        }
    }

    pub(crate) fn on_heartbeat(&mut self, inner: &Arc<EngineInner>) {
        if let Role::Leader(leader) = self {
            leader.replicate_all(inner);
        }
    }

    /// Returns the state to move to if the vote decided the election.
    pub(crate) fn on_vote_response(
        &mut self,
        inner: &Arc<EngineInner>,
        from: NodeId,
        response: RequestVoteResponse,
    ) -> Option<NodeState> {
        match self {
            Role::Candidate(candidate) => candidate.on_vote_response(inner, from, response),
            _ => None,
        }
    }

    pub(crate) fn on_replication_result(
        &mut self,
        inner: &Arc<EngineInner>,
        peer: NodeId,
        prev_log_index: LogIndex,
        entry_count: u64,
        response: Option<AppendEntriesResponse>,
    ) {
        if let Role::Leader(leader) = self {
            leader.on_replication_result(inner, peer, prev_log_index, entry_count, response);
        }
    }

    pub(crate) fn on_snapshot_result(
        &mut self,
        inner: &Arc<EngineInner>,
        peer: NodeId,
        last_included_index: LogIndex,
        response: Option<InstallSnapshotResponse>,
    ) {
        if let Role::Leader(leader) = self {
            leader.on_snapshot_result(inner, peer, last_included_index, response);
        }
    }
}
