//! Raft RPC message definitions and the cluster transport trait.

use super::LogEntry;
use crate::error::Result;
use crate::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};

/// Raft RPC messages, for transports that multiplex everything on one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftMessage {
    /// Request vote from other nodes during election.
    RequestVote(RequestVoteRequest),
    /// Response to RequestVote.
    RequestVoteResponse(RequestVoteResponse),
    /// Append entries (heartbeat or log replication).
    AppendEntries(AppendEntriesRequest),
    /// Response to AppendEntries.
    AppendEntriesResponse(AppendEntriesResponse),
    /// Install snapshot for slow followers.
    InstallSnapshot(InstallSnapshotRequest),
    /// Response to InstallSnapshot.
    InstallSnapshotResponse(InstallSnapshotResponse),
}

/// RequestVote RPC arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// Candidate's term.
    pub term: Term,
    /// Candidate requesting vote.
    pub candidate_id: NodeId,
    /// Index of candidate's last log entry.
    pub last_log_index: LogIndex,
    /// Term of candidate's last log entry.
    pub last_log_term: Term,
}

/// RequestVote RPC response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// Current term, for candidate to update itself.
    pub term: Term,
    /// True if candidate received vote.
    pub vote_granted: bool,
}

impl RequestVoteResponse {
    pub fn granted(term: Term) -> Self {
        Self {
            term,
            vote_granted: true,
        }
    }

    pub fn denied(term: Term) -> Self {
        Self {
            term,
            vote_granted: false,
        }
    }
}

/// AppendEntries RPC arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term.
    pub term: Term,
    /// Leader's ID so followers can redirect clients.
    pub leader_id: NodeId,
    /// Index of log entry immediately preceding new ones.
    pub prev_log_index: LogIndex,
    /// Term of prev_log_index entry.
    pub prev_log_term: Term,
    /// Log entries to store (empty for heartbeat).
    pub entries: Vec<LogEntry>,
    /// Leader's commit index.
    pub leader_commit: LogIndex,
}

/// AppendEntries RPC response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Current term, for leader to update itself.
    pub term: Term,
    /// True if follower contained entry matching prev_log_index and prev_log_term.
    pub success: bool,
    /// Hint for the leader about where to retry after a log mismatch.
    pub conflict_index: Option<LogIndex>,
}

impl AppendEntriesResponse {
    pub fn accepted(term: Term) -> Self {
        Self {
            term,
            success: true,
            conflict_index: None,
        }
    }

    pub fn rejected(term: Term, conflict_index: Option<LogIndex>) -> Self {
        Self {
            term,
            success: false,
            conflict_index,
        }
    }
}

/// InstallSnapshot RPC arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// Leader's term.
    pub term: Term,
    /// Leader's ID.
    pub leader_id: NodeId,
    /// The snapshot replaces all entries up through and including this index.
    pub last_included_index: LogIndex,
    /// Term of last_included_index.
    pub last_included_term: Term,
    /// Serialized state machine image.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// InstallSnapshot RPC response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// Current term, for leader to update itself.
    pub term: Term,
    /// Whether the snapshot was installed (or was already covered).
    pub success: bool,
}

/// Trait for the cluster transport.
///
/// Implementations turn requests into calls against the named peer and
/// return its response, or an error if the peer could not be reached.
#[async_trait::async_trait]
pub trait Cluster: Send + Sync {
    /// Send RequestVote to a peer.
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse>;

    /// Send AppendEntries to a peer.
    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    /// Send InstallSnapshot to a peer.
    async fn install_snapshot(
        &self,
        target: NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;
}
