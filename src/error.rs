//! Error types for the Strata Raft engine.
//!
//! This module provides a unified error type [`RaftError`] for all engine
//! operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Consensus**: not-leader rejections and engine lifecycle errors
//! - **Log/Snapshot**: log shape violations and compaction failures
//! - **Storage**: persistence adapter failures (RocksDB, encoding)
//! - **State machine**: failures reported by the replicated application
//! - **Network**: transport failures and timeouts raised by a `Cluster`
//! - **Configuration**: invalid settings
//!
//! Expected Raft control flow (stale terms, log mismatches, denied votes)
//! is never reported through this type; those outcomes are typed RPC
//! responses.
//!
//! # Example
//!
//! ```rust
//! use strata_raft::error::{RaftError, Result};
//!
//! fn route(err: &RaftError) -> Result<()> {
//!     if err.is_retryable() {
//!         // try again, possibly against `leader`
//!         return Ok(());
//!     }
//!     Err(RaftError::Internal(err.to_string()))
//! }
//! ```

use crate::types::NodeId;
use std::io;
use thiserror::Error;

/// Main error type for Raft engine operations.
#[derive(Error, Debug)]
pub enum RaftError {
    // Consensus errors
    #[error("Not the leader. Leader is: {leader:?}")]
    NotLeader { leader: Option<NodeId> },

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    // Log and snapshot errors
    #[error("Raft log error: {0}")]
    RaftLog(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("State machine error: {0}")]
    StateMachine(String),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("RocksDB error: {0}")]
    RocksDb(String),

    // Cluster and network errors
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Network error: {0}")]
    Network(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RaftError {
    /// Check if the caller may retry the operation (possibly elsewhere).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RaftError::NotLeader { .. }
                | RaftError::ServiceUnavailable(_)
                | RaftError::Timeout(_)
                | RaftError::Network(_)
        )
    }

    /// Shorthand for the error returned once the engine stops accepting work.
    pub(crate) fn shutting_down() -> Self {
        RaftError::ServiceUnavailable("raft engine is shutting down".to_string())
    }
}

impl From<rocksdb::Error> for RaftError {
    fn from(e: rocksdb::Error) -> Self {
        RaftError::RocksDb(e.to_string())
    }
}

impl From<bincode::Error> for RaftError {
    fn from(e: bincode::Error) -> Self {
        RaftError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for RaftError {
    fn from(e: serde_json::Error) -> Self {
        RaftError::Serialization(e.to_string())
    }
}

/// Result type alias for Raft engine operations.
pub type Result<T> = std::result::Result<T, RaftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(RaftError::NotLeader { leader: Some(2) }.is_retryable());
        assert!(RaftError::shutting_down().is_retryable());
        assert!(RaftError::Timeout(100).is_retryable());
        assert!(!RaftError::Storage("disk full".into()).is_retryable());
        assert!(!RaftError::StateMachine("bad command".into()).is_retryable());
    }

    #[test]
    fn test_display() {
        let err = RaftError::NotLeader { leader: Some(3) };
        assert_eq!(err.to_string(), "Not the leader. Leader is: Some(3)");

        let err = RaftError::InvalidConfig {
            field: "peers".into(),
            reason: "duplicate".into(),
        };
        assert_eq!(err.to_string(), "Invalid configuration: peers: duplicate");
    }

    #[test]
    fn test_from_serde_json() {
        let parse: std::result::Result<u64, _> = serde_json::from_str("not json");
        let err: RaftError = parse.unwrap_err().into();
        assert!(matches!(err, RaftError::Serialization(_)));
    }
}
