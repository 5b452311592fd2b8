//! Observability for the Raft engine.
//!
//! Provides logging initialisation and the engine's metric helpers. Metrics
//! go through the `metrics` facade; a host process installs whichever
//! recorder/exporter it uses.

use crate::config::ObservabilityConfig;
use crate::error::{RaftError, Result};
use crate::raft::NodeState;
use crate::types::{LogIndex, NodeId, Term};
use metrics::{counter, gauge};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging.
///
/// `RUST_LOG` takes precedence over `config.log_level`. Fails if a global
/// subscriber is already installed.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| RaftError::Internal(format!("Failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| RaftError::Internal(format!("Failed to init logging: {}", e)))?;
    }

    info!("Observability initialized");
    Ok(())
}

/// Update term and role gauges after a transition or term change.
pub fn record_role(node_id: NodeId, state: NodeState, term: Term) {
    let node = node_id.to_string();
    gauge!("raft_current_term", "node" => node.clone()).set(term as f64);
    gauge!("raft_is_leader", "node" => node).set(if state.is_leader() { 1.0 } else { 0.0 });
}

/// Record the start of an election.
pub fn record_election(node_id: NodeId) {
    counter!("raft_elections_started_total", "node" => node_id.to_string()).increment(1);
}

/// Record a new commit index.
pub fn record_commit(node_id: NodeId, commit_index: LogIndex) {
    gauge!("raft_commit_index", "node" => node_id.to_string()).set(commit_index as f64);
}

/// Record an entry handed to the state machine.
pub fn record_applied(node_id: NodeId, last_applied: LogIndex) {
    let node = node_id.to_string();
    counter!("raft_entries_applied_total", "node" => node.clone()).increment(1);
    gauge!("raft_last_applied", "node" => node).set(last_applied as f64);
}

/// Record an accepted client proposal.
pub fn record_proposal(node_id: NodeId) {
    counter!("raft_proposals_total", "node" => node_id.to_string()).increment(1);
}

/// Record a completed snapshot (local compaction or installed from the leader).
pub fn record_snapshot(node_id: NodeId, last_snapshot_index: LogIndex) {
    let node = node_id.to_string();
    counter!("raft_snapshots_total", "node" => node.clone()).increment(1);
    gauge!("raft_last_snapshot_index", "node" => node).set(last_snapshot_index as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        let config = ObservabilityConfig::default();
        let _ = init(&config);
        assert!(init(&config).is_err());
    }

    #[test]
    fn test_metrics_without_recorder_are_noops() {
        record_role(1, NodeState::Leader, 3);
        record_election(1);
        record_commit(1, 10);
        record_applied(1, 10);
        record_proposal(1);
        record_snapshot(1, 5);
    }
}
