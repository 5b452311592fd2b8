//! Strata Raft - a Raft consensus engine for replicated state machines.
//!
//! The engine elects a leader among a fixed set of voting members, replicates
//! client commands through a durable log, applies committed entries to a
//! user-supplied state machine in log order, and compacts the log into
//! snapshots that lagging followers can install.
//!
//! # Features
//!
//! - **Leader election**: randomized timeouts, one vote per term, up-to-date log check.
//! - **Log replication**: pipelined AppendEntries with conflict-index back-off.
//! - **Commit and apply**: majority commit of current-term entries, ordered apply.
//! - **Snapshots**: threshold-driven compaction and InstallSnapshot catch-up.
//! - **Pluggable seams**: storage, transport and state machine are traits.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Host: RPC server shim | Client API | Cluster transport     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RaftEngine: command loop | Follower/Candidate/Leader roles │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Apply loop -> StateMachine | Snapshot compaction           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Storage: LogStore + StateManager (memory, RocksDB)         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine owns no sockets. Hosts forward incoming RPCs to
//! [`RaftEngine::handle_request_vote`], [`RaftEngine::handle_append_entries`]
//! and [`RaftEngine::handle_install_snapshot`], and supply a
//! [`raft::Cluster`] for outgoing ones.

pub mod config;
pub mod error;
pub mod observability;
pub mod raft;
pub mod shutdown;
pub mod storage;
pub mod types;

// Re-exports
pub use config::{NodeConfig, ObservabilityConfig, RaftConfig};
pub use error::{RaftError, Result};
pub use raft::{EngineStatus, LogEntry, NodeState, RaftEngine, StateMachine};
pub use storage::{LogStore, MemoryStore, RocksStore, StateManager};
pub use types::*;
