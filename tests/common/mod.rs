//! Common test utilities for integration tests.
//!
//! [`LocalNetwork`] wires engines together in-process: each engine gets a
//! [`LocalTransport`] whose RPCs call straight into the target engine's
//! `handle_*` methods. Nodes can be isolated and healed to simulate
//! partitions.

pub mod assertions;

pub use assertions::*;

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use strata_raft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, Cluster, InstallSnapshotRequest,
    InstallSnapshotResponse, RequestVoteRequest, RequestVoteResponse,
};
use strata_raft::{
    MemoryStore, NodeId, RaftConfig, RaftEngine, RaftError, Result, StateMachine,
};

/// State machine that records every applied command.
///
/// Replies with the command's 1-based position in the history. The snapshot
/// is the JSON-encoded history.
#[derive(Default)]
pub struct RecordingMachine {
    applied: Mutex<Vec<Vec<u8>>>,
}

impl RecordingMachine {
    pub fn history(&self) -> Vec<Vec<u8>> {
        self.applied.lock().clone()
    }
}

#[async_trait::async_trait]
impl StateMachine for RecordingMachine {
    async fn apply(&self, command: &[u8]) -> Result<Vec<u8>> {
        let mut applied = self.applied.lock();
        applied.push(command.to_vec());
        Ok(applied.len().to_string().into_bytes())
    }

    async fn create_snapshot(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&*self.applied.lock())?)
    }

    async fn restore_from_snapshot(&self, snapshot: &[u8]) -> Result<()> {
        *self.applied.lock() = serde_json::from_slice(snapshot)?;
        Ok(())
    }
}

/// In-process registry of engines addressed by node ID.
#[derive(Default)]
pub struct LocalNetwork {
    nodes: RwLock<HashMap<NodeId, Arc<RaftEngine>>>,
    isolated: RwLock<HashSet<NodeId>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Outgoing transport for `from`.
    pub fn transport(self: &Arc<Self>, from: NodeId) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            from,
            net: Arc::clone(self),
        })
    }

    pub fn register(&self, engine: Arc<RaftEngine>) {
        self.nodes.write().insert(engine.node_id(), engine);
    }

    /// Cut `node` off from every other node, in both directions.
    pub fn isolate(&self, node: NodeId) {
        self.isolated.write().insert(node);
    }

    pub fn heal(&self, node: NodeId) {
        self.isolated.write().remove(&node);
    }

    pub fn is_isolated(&self, node: NodeId) -> bool {
        self.isolated.read().contains(&node)
    }

    fn route(&self, from: NodeId, to: NodeId) -> Result<Arc<RaftEngine>> {
        if self.is_isolated(from) || self.is_isolated(to) {
            return Err(RaftError::Network(format!(
                "Partitioned: {} -> {}",
                from, to
            )));
        }
        self.nodes
            .read()
            .get(&to)
            .cloned()
            .ok_or(RaftError::NodeNotFound(to))
    }
}

/// [`Cluster`] implementation for one node of a [`LocalNetwork`].
pub struct LocalTransport {
    from: NodeId,
    net: Arc<LocalNetwork>,
}

#[async_trait::async_trait]
impl Cluster for LocalTransport {
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let engine = self.net.route(self.from, target)?;
        engine.handle_request_vote(request).await
    }

    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let engine = self.net.route(self.from, target)?;
        engine.handle_append_entries(request).await
    }

    async fn install_snapshot(
        &self,
        target: NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let engine = self.net.route(self.from, target)?;
        engine.handle_install_snapshot(request).await
    }
}

/// One member of a [`TestCluster`].
pub struct TestNode {
    pub engine: Arc<RaftEngine>,
    pub machine: Arc<RecordingMachine>,
    pub store: Arc<MemoryStore>,
}

/// A running cluster of in-memory engines.
pub struct TestCluster {
    pub net: Arc<LocalNetwork>,
    pub nodes: HashMap<NodeId, TestNode>,
}

/// Timeouts short enough for tests to converge quickly.
pub fn fast_config(node_id: NodeId, peers: Vec<NodeId>) -> RaftConfig {
    RaftConfig {
        election_timeout_min: Duration::from_millis(150),
        election_timeout_max: Duration::from_millis(300),
        heartbeat_interval: Duration::from_millis(30),
        rpc_timeout: Duration::from_millis(100),
        snapshot_rpc_timeout: Duration::from_secs(2),
        ..RaftConfig::new(node_id, peers)
    }
}

impl TestCluster {
    /// Start `size` nodes numbered from 1, letting `customize` adjust each config.
    pub async fn start<F>(size: u64, customize: F) -> Self
    where
        F: Fn(&mut RaftConfig),
    {
        let net = LocalNetwork::new();
        let ids: Vec<NodeId> = (1..=size).collect();
        let mut nodes = HashMap::new();

        for &id in &ids {
            let peers = ids.iter().copied().filter(|&p| p != id).collect();
            let mut config = fast_config(id, peers);
            customize(&mut config);

            let store = Arc::new(MemoryStore::new());
            let machine = Arc::new(RecordingMachine::default());
            let engine = Arc::new(
                RaftEngine::new(
                    config,
                    store.clone(),
                    store.clone(),
                    machine.clone(),
                    net.transport(id),
                )
                .expect("valid config"),
            );
            net.register(Arc::clone(&engine));
            nodes.insert(
                id,
                TestNode {
                    engine,
                    machine,
                    store,
                },
            );
        }

        for node in nodes.values() {
            node.engine.start().await.expect("engine starts");
        }

        Self { net, nodes }
    }

    pub fn node(&self, id: NodeId) -> &TestNode {
        &self.nodes[&id]
    }

    /// Nodes that currently believe they lead and are reachable.
    pub fn connected_leaders(&self) -> Vec<NodeId> {
        let mut leaders: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(id, node)| node.engine.is_leader() && !self.net.is_isolated(**id))
            .map(|(id, _)| *id)
            .collect();
        leaders.sort_unstable();
        leaders
    }

    /// Wait until exactly one reachable node leads and return it.
    pub async fn wait_for_leader(&self) -> NodeId {
        for _ in 0..250 {
            if let [leader] = self.connected_leaders()[..] {
                return leader;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("No single leader emerged: {:?}", self.connected_leaders());
    }

    /// Propose through whichever node currently leads, retrying across elections.
    pub async fn propose(&self, command: &[u8]) -> Vec<u8> {
        for _ in 0..50 {
            let leader = self.wait_for_leader().await;
            match self.node(leader).engine.propose(command.to_vec()).await {
                Ok(result) => return result,
                Err(RaftError::NotLeader { .. }) => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(e) => panic!("Proposal failed: {}", e),
            }
        }
        panic!("No leader accepted the proposal");
    }

    pub fn histories(&self) -> Vec<(NodeId, Vec<Vec<u8>>)> {
        let mut histories: Vec<_> = self
            .nodes
            .iter()
            .map(|(id, node)| (*id, node.machine.history()))
            .collect();
        histories.sort_by_key(|(id, _)| *id);
        histories
    }

    pub async fn shutdown(&self) {
        for node in self.nodes.values() {
            node.engine.shutdown().await.expect("clean shutdown");
        }
    }
}
