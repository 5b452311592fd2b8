//! Raft node state: roles, persistent state and leader bookkeeping.

use crate::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// The state of a Raft node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    /// Follower state - passive, responds to RPCs.
    Follower,
    /// Candidate state - actively seeking election.
    Candidate,
    /// Leader state - handling client requests and replication.
    Leader,
}

impl NodeState {
    pub fn is_leader(&self) -> bool {
        matches!(self, NodeState::Leader)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Follower => write!(f, "Follower"),
            NodeState::Candidate => write!(f, "Candidate"),
            NodeState::Leader => write!(f, "Leader"),
        }
    }
}

/// Persistent state that must survive restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    /// Current term (latest term server has seen).
    pub current_term: Term,
    /// CandidateId that received vote in current term (or None).
    pub voted_for: Option<NodeId>,
}

impl PersistentState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt `term` if it is newer, forgetting the vote cast in the old term.
    /// Returns true if the term changed.
    pub fn observe_term(&mut self, term: Term) -> bool {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            true
        } else {
            false
        }
    }
}

/// Number of votes (or replicas) that make a strict majority.
pub fn quorum_size(cluster_size: usize) -> usize {
    cluster_size / 2 + 1
}

/// Per-peer replication cursors, valid while this node leads.
#[derive(Debug, Clone)]
pub struct ReplicationProgress {
    /// For each server, index of the next log entry to send.
    pub next_index: HashMap<NodeId, LogIndex>,
    /// For each server, index of highest log entry known to be replicated.
    pub match_index: HashMap<NodeId, LogIndex>,
    /// Peers with an outstanding AppendEntries/InstallSnapshot.
    in_flight: HashSet<NodeId>,
}

impl ReplicationProgress {
    pub fn new(peers: &[NodeId], last_log_index: LogIndex) -> Self {
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();

        for &peer in peers {
            // Initialize nextIndex to leader's last log index + 1
            next_index.insert(peer, last_log_index + 1);
            // Initialize matchIndex to 0
            match_index.insert(peer, 0);
        }

        Self {
            next_index,
            match_index,
            in_flight: HashSet::new(),
        }
    }

    pub fn next_for(&self, peer: NodeId) -> LogIndex {
        self.next_index.get(&peer).copied().unwrap_or(1)
    }

    pub fn match_for(&self, peer: NodeId) -> LogIndex {
        self.match_index.get(&peer).copied().unwrap_or(0)
    }

    /// Record a successful replication up to `match_index`.
    ///
    /// Match indices never move backwards; a late response for an older
    /// request cannot undo newer progress.
    pub fn update_match(&mut self, peer: NodeId, match_index: LogIndex) {
        let current = self.match_for(peer);
        let new_match = current.max(match_index);
        self.match_index.insert(peer, new_match);
        self.next_index.insert(peer, new_match + 1);
    }

    /// Move `next_index` back after a rejection, using the follower's hint if any.
    pub fn back_off(&mut self, peer: NodeId, conflict_index: Option<LogIndex>) {
        let current = self.next_for(peer);
        let next = match conflict_index {
            Some(hint) => hint.min(current.saturating_sub(1)),
            None => current.saturating_sub(1),
        };
        // Never retry below what the peer is known to hold.
        let floor = self.match_for(peer) + 1;
        self.next_index.insert(peer, next.max(floor).max(1));
    }

    /// Mark a request as outstanding. Returns false if one already is.
    pub fn begin_request(&mut self, peer: NodeId) -> bool {
        self.in_flight.insert(peer)
    }

    /// Clear the outstanding-request flag for a peer.
    pub fn finish_request(&mut self, peer: NodeId) {
        self.in_flight.remove(&peer);
    }

    pub fn is_in_flight(&self, peer: NodeId) -> bool {
        self.in_flight.contains(&peer)
    }

    /// Highest index stored on at least `quorum` servers, counting the leader.
    pub fn quorum_match_index(&self, leader_last_index: LogIndex, quorum: usize) -> LogIndex {
        let mut indices: Vec<LogIndex> = self.match_index.values().copied().collect();
        indices.push(leader_last_index);

        indices.sort_unstable();
        indices.reverse();

        // The index at position quorum - 1 is the highest index
        // that at least quorum servers have
        indices.get(quorum.saturating_sub(1)).copied().unwrap_or(0)
    }
}

/// Compute the commit index a leader may advance to, if any.
///
/// Only an entry from the leader's own term is committed by counting
/// replicas; earlier entries become committed implicitly once it is.
pub fn next_commit_index<F>(
    progress: &ReplicationProgress,
    leader_last_index: LogIndex,
    quorum: usize,
    commit_index: LogIndex,
    current_term: Term,
    term_at: F,
) -> Option<LogIndex>
where
    F: Fn(LogIndex) -> Option<Term>,
{
    let candidate = progress.quorum_match_index(leader_last_index, quorum);
    if candidate <= commit_index {
        return None;
    }
    match term_at(candidate) {
        Some(term) if term == current_term => Some(candidate),
        _ => None,
    }
}
