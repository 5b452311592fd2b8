//! Configuration module for the Raft engine.

use crate::error::{RaftError, Result};
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Raft engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// This node's ID.
    pub node_id: NodeId,
    /// IDs of the other voting members.
    #[serde(default)]
    pub peers: Vec<NodeId>,
    /// Minimum election timeout.
    #[serde(with = "humantime_serde")]
    pub election_timeout_min: Duration,
    /// Maximum election timeout.
    #[serde(with = "humantime_serde")]
    pub election_timeout_max: Duration,
    /// Heartbeat interval.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Timeout for a single RequestVote or AppendEntries RPC.
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,
    /// Timeout for a single InstallSnapshot RPC.
    #[serde(with = "humantime_serde")]
    pub snapshot_rpc_timeout: Duration,
    /// Maximum entries per AppendEntries RPC.
    pub max_entries_per_append: usize,
    /// Applied entries beyond the last snapshot before compacting.
    pub snapshot_threshold: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            peers: Vec::new(),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            rpc_timeout: Duration::from_millis(100),
            snapshot_rpc_timeout: Duration::from_secs(10),
            max_entries_per_append: 100,
            snapshot_threshold: 10000,
        }
    }
}

impl RaftConfig {
    /// Create a configuration for `node_id` with the given peers and defaults otherwise.
    pub fn new(node_id: NodeId, peers: Vec<NodeId>) -> Self {
        Self {
            node_id,
            peers,
            ..Default::default()
        }
    }

    /// Number of voting members, including this node.
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.node_id == 0 {
            return Err(invalid("node_id", "Node ID must be non-zero"));
        }

        if self.peers.contains(&self.node_id) {
            return Err(invalid("peers", "Peers must not include this node"));
        }

        let unique: HashSet<_> = self.peers.iter().collect();
        if unique.len() != self.peers.len() {
            return Err(invalid("peers", "Peer IDs must be unique"));
        }

        if self.peers.contains(&0) {
            return Err(invalid("peers", "Peer IDs must be non-zero"));
        }

        if self.election_timeout_min.is_zero() {
            return Err(invalid(
                "election_timeout_min",
                "Election timeout must be non-zero",
            ));
        }

        if self.election_timeout_max < self.election_timeout_min {
            return Err(invalid(
                "election_timeout_max",
                "Maximum election timeout must not be below the minimum",
            ));
        }

        if self.heartbeat_interval.is_zero()
            || self.heartbeat_interval >= self.election_timeout_min
        {
            return Err(invalid(
                "heartbeat_interval",
                "Heartbeat interval must be non-zero and below the minimum election timeout",
            ));
        }

        if self.rpc_timeout.is_zero() || self.snapshot_rpc_timeout.is_zero() {
            return Err(invalid("rpc_timeout", "RPC timeouts must be non-zero"));
        }

        if self.max_entries_per_append == 0 {
            return Err(invalid(
                "max_entries_per_append",
                "At least one entry per append is required",
            ));
        }

        if self.snapshot_threshold == 0 {
            return Err(invalid(
                "snapshot_threshold",
                "Snapshot threshold must be non-zero",
            ));
        }

        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> RaftError {
    RaftError::InvalidConfig {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (an `EnvFilter` directive).
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Everything a process hosting one engine needs, loadable from a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Engine configuration.
    pub raft: RaftConfig,
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
    /// Directory for the durable log store.
    pub data_dir: PathBuf,
}

impl NodeConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RaftError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| RaftError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(invalid("data_dir", "Data directory must be set"));
        }
        self.raft.validate()
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = RaftConfig::default();
        assert_eq!(config.node_id, 1);
        assert_eq!(config.election_timeout_min, Duration::from_millis(150));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(50));
        assert_eq!(config.cluster_size(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_self_peer() {
        let config = RaftConfig::new(1, vec![1, 2]);
        assert!(matches!(
            config.validate(),
            Err(RaftError::InvalidConfig { field, .. }) if field == "peers"
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_peers() {
        let config = RaftConfig::new(1, vec![2, 2]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_slow_heartbeat() {
        let config = RaftConfig {
            heartbeat_interval: Duration::from_millis(200),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RaftError::InvalidConfig { field, .. }) if field == "heartbeat_interval"
        ));
    }

    #[test]
    fn test_validate_rejects_inverted_window() {
        let config = RaftConfig {
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(150),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_duration() {
        use humantime_serde::parse_duration;
        assert_eq!(parse_duration("150ms"), Ok(Duration::from_millis(150)));
        assert_eq!(parse_duration("5s"), Ok(Duration::from_secs(5)));
        assert_eq!(parse_duration("2m"), Ok(Duration::from_secs(120)));
        assert_eq!(parse_duration("75"), Ok(Duration::from_millis(75)));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_node_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "raft": {{
                    "node_id": 2,
                    "peers": [1, 3],
                    "election_timeout_min": "200ms",
                    "election_timeout_max": "400ms",
                    "heartbeat_interval": "50ms",
                    "rpc_timeout": "100ms",
                    "snapshot_rpc_timeout": "10s",
                    "max_entries_per_append": 64,
                    "snapshot_threshold": 1000
                }},
                "data_dir": "/var/lib/strata/raft"
            }}"#
        )
        .unwrap();

        let config = NodeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.raft.node_id, 2);
        assert_eq!(config.raft.peers, vec![1, 3]);
        assert_eq!(config.raft.election_timeout_max, Duration::from_millis(400));
        assert_eq!(config.raft.snapshot_rpc_timeout, Duration::from_secs(10));
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn test_node_config_from_file_rejects_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ \"raft\": 5 }}").unwrap();
        assert!(matches!(
            NodeConfig::from_file(file.path()),
            Err(RaftError::Config(_))
        ));
    }
}
