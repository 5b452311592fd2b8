//! Commands consumed by the engine's single command loop.

use super::rpc::*;
use crate::error::Result;
use crate::types::{LogIndex, NodeId, Term};
use tokio::sync::oneshot;

/// Completion handle for a client proposal.
pub(crate) type ProposalReply = oneshot::Sender<Result<Vec<u8>>>;

/// Command for the Raft engine.
///
/// Events raised by role tasks (timers, RPC fan-out) carry the epoch of the
/// role that raised them; the loop drops them once that role has been left.
pub(crate) enum Command {
    /// A peer reported a term higher than ours.
    HigherTerm { sender: NodeId, term: Term },
    /// Handle incoming RequestVote RPC.
    RequestVote {
        request: RequestVoteRequest,
        reply: oneshot::Sender<RequestVoteResponse>,
    },
    /// Handle incoming AppendEntries RPC.
    AppendEntries {
        request: AppendEntriesRequest,
        reply: oneshot::Sender<AppendEntriesResponse>,
    },
    /// Handle incoming InstallSnapshot RPC.
    InstallSnapshot {
        request: InstallSnapshotRequest,
        reply: oneshot::Sender<InstallSnapshotResponse>,
    },
    /// Propose a new command to be replicated.
    Propose {
        command: Vec<u8>,
        reply: ProposalReply,
    },
    /// Election timer expired. `None` applies to whatever role is current.
    Timeout { epoch: Option<u64> },
    /// Leader heartbeat tick.
    Heartbeat { epoch: u64 },
    /// A peer answered our RequestVote.
    VoteResponse {
        epoch: u64,
        from: NodeId,
        response: RequestVoteResponse,
    },
    /// An AppendEntries round trip finished; `None` if the peer was unreachable.
    ReplicationResult {
        epoch: u64,
        peer: NodeId,
        prev_log_index: LogIndex,
        entry_count: u64,
        response: Option<AppendEntriesResponse>,
    },
    /// An InstallSnapshot round trip finished; `None` if the peer was unreachable.
    SnapshotResult {
        epoch: u64,
        peer: NodeId,
        last_included_index: LogIndex,
        response: Option<InstallSnapshotResponse>,
    },
}

impl Command {
    /// Short name for logging.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Command::HigherTerm { .. } => "higher_term",
            Command::RequestVote { .. } => "request_vote",
            Command::AppendEntries { .. } => "append_entries",
            Command::InstallSnapshot { .. } => "install_snapshot",
            Command::Propose { .. } => "propose",
            Command::Timeout { .. } => "timeout",
            Command::Heartbeat { .. } => "heartbeat",
            Command::VoteResponse { .. } => "vote_response",
            Command::ReplicationResult { .. } => "replication_result",
            Command::SnapshotResult { .. } => "snapshot_result",
        }
    }

    /// Epoch of the role that raised this event, for role-internal events.
    pub(crate) fn epoch(&self) -> Option<u64> {
        match self {
            Command::Timeout { epoch } => *epoch,
            Command::Heartbeat { epoch }
            | Command::VoteResponse { epoch, .. }
            | Command::ReplicationResult { epoch, .. }
            | Command::SnapshotResult { epoch, .. } => Some(*epoch),
            _ => None,
        }
    }
}
