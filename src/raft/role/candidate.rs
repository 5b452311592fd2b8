//! Candidate: runs one election per term.

use super::timer::ElectionTimer;
use crate::error::Result;
use crate::observability;
use crate::raft::command::Command;
use crate::raft::engine::EngineInner;
use crate::raft::rpc::*;
use crate::raft::state::quorum_size;
use crate::raft::NodeState;
use crate::shutdown::ShutdownSignal;
use crate::types::{NodeId, Term};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub(crate) struct Candidate {
    pub(super) epoch: u64,
    pub(super) signal: ShutdownSignal,
    term: Term,
    votes: HashSet<NodeId>,
    timer: ElectionTimer,
}

impl Candidate {
    /// Start an election in the next term. Returns true if the vote for
    /// ourselves is already a majority.
    pub(super) async fn enter(
        inner: &Arc<EngineInner>,
        epoch: u64,
        signal: ShutdownSignal,
    ) -> Result<(Self, bool)> {
        let node_id = inner.node_id();
        let term = inner.state.current_term() + 1;
        inner.state.set_current_term(term).await?;
        inner.state.set_voted_for(Some(node_id)).await?;
        inner.set_leader(None);
        observability::record_election(node_id);

        let mut votes = HashSet::new();
        votes.insert(node_id);

        let candidate = Self {
            epoch,
            signal,
            term,
            votes,
            timer: ElectionTimer::new(
                inner.config.election_timeout_min,
                inner.config.election_timeout_max,
            ),
        };

        info!(node_id, term, "Starting election");

        if candidate.has_quorum(inner) {
            return Ok((candidate, true));
        }

        candidate.request_votes(inner);
        let engine = Arc::clone(inner);
        candidate.timer.spawn(candidate.signal.clone(), move || {
            engine.try_enqueue(Command::Timeout { epoch: Some(epoch) });
        });
        Ok((candidate, false))
    }

    fn has_quorum(&self, inner: &EngineInner) -> bool {
        self.votes.len() >= quorum_size(inner.config.cluster_size())
    }

    /// Fan out RequestVote to every peer; responses come back as commands.
    fn request_votes(&self, inner: &Arc<EngineInner>) {
        let (last_log_term, last_log_index) = inner.log.last_entry_info();
        let request = RequestVoteRequest {
            term: self.term,
            candidate_id: inner.node_id(),
            last_log_index,
            last_log_term,
        };

        let engine = Arc::clone(inner);
        let signal = self.signal.clone();
        let epoch = self.epoch;
        let term = self.term;
        let rpc_timeout = inner.config.rpc_timeout;

        tokio::spawn(async move {
            let mut requests: FuturesUnordered<_> = engine
                .config
                .peers
                .iter()
                .map(|&peer| {
                    let cluster = Arc::clone(&engine.cluster);
                    let request = request.clone();
                    async move {
                        let result = timeout(rpc_timeout, cluster.request_vote(peer, request)).await;
                        (peer, result)
                    }
                })
                .collect();

            loop {
                let next = tokio::select! {
                    _ = signal.cancelled() => return,
                    next = requests.next() => next,
                };
                match next {
                    None => return,
                    Some((peer, Ok(Ok(response)))) => {
                        if response.term > term {
                            engine.process_higher_term(peer, response.term);
                        } else {
                            engine.try_enqueue(Command::VoteResponse {
                                epoch,
                                from: peer,
                                response,
                            });
                        }
                    }
                    Some((peer, Ok(Err(e)))) => {
                        debug!(node_id = engine.node_id(), peer, error = %e, "RequestVote failed");
                    }
                    Some((peer, Err(_))) => {
                        debug!(node_id = engine.node_id(), peer, "RequestVote timed out");
                    }
                }
            }
        });
    }

    /// Count a vote. Returns Leader once a majority is reached.
    pub(super) fn on_vote_response(
        &mut self,
        inner: &Arc<EngineInner>,
        from: NodeId,
        response: RequestVoteResponse,
    ) -> Option<NodeState> {
        if response.term != self.term || !response.vote_granted {
            debug!(
                node_id = inner.node_id(),
                from,
                term = response.term,
                "Vote not granted"
            );
            return None;
        }
        if !inner.config.peers.contains(&from) {
            warn!(node_id = inner.node_id(), from, "Vote from unknown node ignored");
            return None;
        }

        self.votes.insert(from);
        debug!(
            node_id = inner.node_id(),
            from,
            votes = self.votes.len(),
            "Received vote"
        );

        if self.has_quorum(inner) {
            info!(
                node_id = inner.node_id(),
                term = self.term,
                votes = self.votes.len(),
                "Won election"
            );
            Some(NodeState::Leader)
        } else {
            None
        }
    }
}
