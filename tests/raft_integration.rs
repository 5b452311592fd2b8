//! Raft consensus integration tests.
//!
//! Multi-node clusters wired through an in-process network: election,
//! replication, failover, snapshot catch-up and durable restart.

#[allow(dead_code)]
mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use strata_raft::{
    LogStore, NodeState, RaftConfig, RaftEngine, RaftError, RocksStore, StateManager,
};
use tempfile::TempDir;

// =============================================================================
// Election
// =============================================================================

#[tokio::test]
async fn test_three_node_cluster_elects_one_leader() {
    let cluster = TestCluster::start(3, |_| {}).await;
    let leader = cluster.wait_for_leader().await;
    let term = cluster.node(leader).engine.status().current_term;

    assert_eventually!(
        cluster
            .nodes
            .values()
            .all(|n| n.engine.leader_id() == Some(leader)),
        3000
    );

    for (id, node) in &cluster.nodes {
        let status = node.engine.status();
        assert_eq!(status.current_term, term, "node {} disagrees on term", id);
        if *id != leader {
            assert_eq!(status.state, NodeState::Follower);
        }
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_follower_redirects_proposals_to_leader() {
    let cluster = TestCluster::start(3, |_| {}).await;
    let leader = cluster.wait_for_leader().await;
    let follower = (1..=3).find(|&id| id != leader).unwrap();

    let engine = &cluster.node(follower).engine;
    assert_eventually!(engine.leader_id() == Some(leader), 3000);

    let err = engine.propose(b"x".to_vec()).await.unwrap_err();
    match err {
        RaftError::NotLeader { leader: hint } => assert_eq!(hint, Some(leader)),
        other => panic!("Expected NotLeader, got {}", other),
    }

    cluster.shutdown().await;
}

// =============================================================================
// Replication
// =============================================================================

#[tokio::test]
async fn test_replication_reaches_every_node() {
    let cluster = TestCluster::start(3, |_| {}).await;

    for i in 1..=10u32 {
        let result = cluster.propose(format!("cmd-{}", i).as_bytes()).await;
        assert_eq!(result, i.to_string().into_bytes());
    }

    assert_eventually!(
        cluster.nodes.values().all(|n| n.machine.history().len() == 10),
        5000
    );
    assert_histories_agree(&cluster.histories());

    for node in cluster.nodes.values() {
        let status = node.engine.status();
        assert_eq!(status.commit_index, 10);
        assert_eq!(status.last_applied, 10);
        assert_eq!(node.store.last_index(), 10);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_proposals_are_totally_ordered() {
    let cluster = Arc::new(TestCluster::start(3, |_| {}).await);
    let leader = cluster.wait_for_leader().await;
    let engine = Arc::clone(&cluster.node(leader).engine);

    let tasks: Vec<_> = (0..20u8)
        .map(|i| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.propose(vec![i]).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eventually!(
        cluster.nodes.values().all(|n| n.machine.history().len() == 20),
        5000
    );
    let histories = cluster.histories();
    assert_histories_agree(&histories);

    let mut commands = histories[0].1.clone();
    commands.sort();
    commands.dedup();
    assert_eq!(commands.len(), 20);

    cluster.shutdown().await;
}

// =============================================================================
// Failover
// =============================================================================

#[tokio::test]
async fn test_leader_failover_discards_uncommitted_entries() {
    let cluster = TestCluster::start(3, |_| {}).await;
    cluster.propose(b"a").await;
    let old_leader = cluster.wait_for_leader().await;

    cluster.net.isolate(old_leader);

    // The cut-off leader accepts the proposal but can never commit it.
    let stale_engine = Arc::clone(&cluster.node(old_leader).engine);
    let stale = tokio::spawn(async move { stale_engine.propose(b"stale".to_vec()).await });
    let old_store = Arc::clone(&cluster.node(old_leader).store);
    assert_eventually!(old_store.last_index() == 2, 3000);

    let new_leader = cluster.wait_for_leader().await;
    assert_ne!(new_leader, old_leader);
    assert!(
        cluster.node(new_leader).engine.status().current_term
            > cluster.node(old_leader).engine.status().current_term
    );
    cluster.propose(b"b").await;

    cluster.net.heal(old_leader);

    let result = tokio::time::timeout(Duration::from_secs(5), stale)
        .await
        .expect("stale proposal resolves")
        .unwrap();
    assert!(matches!(result, Err(RaftError::NotLeader { .. })));

    let old = cluster.node(old_leader);
    assert_eventually!(
        old.machine.history() == vec![b"a".to_vec(), b"b".to_vec()],
        5000
    );
    assert!(!old.engine.is_leader());
    assert_histories_agree(&cluster.histories());

    cluster.shutdown().await;
}

// =============================================================================
// Snapshots
// =============================================================================

#[tokio::test]
async fn test_lagging_follower_catches_up_from_snapshot() {
    let cluster = TestCluster::start(3, |config| config.snapshot_threshold = 5).await;
    let leader = cluster.wait_for_leader().await;
    let lagging = (1..=3).find(|&id| id != leader).unwrap();

    cluster.net.isolate(lagging);
    for i in 0..12u8 {
        cluster.propose(&[i]).await;
    }

    let leader_node = cluster.node(cluster.wait_for_leader().await);
    assert_eventually!(leader_node.store.last_snapshot_index() >= 5, 5000);

    cluster.net.heal(lagging);

    let follower = cluster.node(lagging);
    assert_eventually!(follower.machine.history().len() == 12, 10000);
    assert!(follower.store.last_snapshot_index() >= 5);
    assert_histories_agree(&cluster.histories());

    cluster.shutdown().await;
}

// =============================================================================
// Durability
// =============================================================================

fn durable_engine(store: Arc<RocksStore>, machine: Arc<RecordingMachine>) -> RaftEngine {
    let config = RaftConfig {
        snapshot_threshold: 2,
        ..fast_config(1, vec![])
    };
    RaftEngine::new(
        config,
        store.clone(),
        store,
        machine,
        LocalNetwork::new().transport(1),
    )
    .unwrap()
}

async fn reopen(path: &std::path::Path) -> RocksStore {
    // Background tasks of a stopped engine may briefly keep the database open.
    for _ in 0..100 {
        if let Ok(store) = RocksStore::open(path) {
            return store;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("Could not reopen store at {:?}", path);
}

#[tokio::test]
async fn test_restart_recovers_from_durable_store() {
    let dir = TempDir::new().unwrap();

    {
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());
        let machine = Arc::new(RecordingMachine::default());
        let engine = durable_engine(store, machine.clone());
        engine.start().await.unwrap();
        assert_eventually!(engine.is_leader(), 3000);

        for command in [b"a", b"b", b"c"] {
            engine.propose(command.to_vec()).await.unwrap();
        }
        assert_eventually!(engine.status().snapshots_taken >= 1, 3000);
        engine.shutdown().await.unwrap();
    }

    let store = Arc::new(reopen(dir.path()).await);
    assert_eq!(store.current_term(), 1);
    assert_eq!(store.voted_for(), Some(1));
    assert_eq!(store.last_index(), 3);
    let snapshot_index = store.last_snapshot_index();
    assert!(snapshot_index >= 2);

    let machine = Arc::new(RecordingMachine::default());
    let engine = durable_engine(store, machine.clone());
    engine.start().await.unwrap();

    // The snapshot is restored before anything else runs.
    let status = engine.status();
    assert_eq!(status.last_applied, snapshot_index);
    assert_eq!(machine.history().len() as u64, snapshot_index);

    assert_eventually!(engine.is_leader(), 3000);
    assert_eq!(engine.status().current_term, 2);

    // Entries from the earlier term commit along with the first new one.
    engine.propose(b"d".to_vec()).await.unwrap();
    assert_eq!(
        machine.history(),
        vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
    );

    engine.shutdown().await.unwrap();
}
