//! Raft consensus engine.
//!
//! This module implements leader election, log replication, commit-index
//! advancement, entry application and snapshot compaction for a replicated
//! state machine. Storage, transport and the state machine itself are
//! pluggable: see [`crate::storage`], [`Cluster`] and [`StateMachine`].

// Deny unsafe code patterns in this critical consensus module.
// unwrap() calls can cause panics that break consensus.
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod apply;
mod command;
mod engine;
mod log;
mod role;
pub mod rpc;
mod snapshot;
mod state;

pub use engine::{EngineStatus, RaftEngine};
pub use log::{is_up_to_date, LogEntry, RaftLog};
pub use rpc::{
    AppendEntriesRequest, AppendEntriesResponse, Cluster, InstallSnapshotRequest,
    InstallSnapshotResponse, RaftMessage, RequestVoteRequest, RequestVoteResponse,
};
pub use state::{next_commit_index, quorum_size, NodeState, PersistentState, ReplicationProgress};

use crate::error::Result;

/// Trait for state machines that can be driven by Raft.
///
/// Methods take `&self`; implementations provide their own interior
/// mutability. The engine never calls `apply` concurrently with itself,
/// with `create_snapshot` or with `restore_from_snapshot`.
#[async_trait::async_trait]
pub trait StateMachine: Send + Sync {
    /// Apply a committed command, returning the caller-visible result.
    ///
    /// `Err(RaftError::StateMachine(_))` is the command's deterministic
    /// outcome: the entry still counts as applied and the proposer receives
    /// the error. Any other error is treated as a transient failure; the
    /// entry is not applied and is offered again on the next attempt.
    async fn apply(&self, command: &[u8]) -> Result<Vec<u8>>;

    /// Serialize the current state.
    async fn create_snapshot(&self) -> Result<Vec<u8>>;

    /// Replace the current state with a snapshot.
    async fn restore_from_snapshot(&self, snapshot: &[u8]) -> Result<()>;
}
