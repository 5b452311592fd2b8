//! The Raft engine: public surface, command loop and role transitions.
//!
//! Every mutation of term, vote, role and log shape happens inside a single
//! consumer task draining an unbounded command queue. Callers (RPC servers,
//! clients) only enqueue a command together with a oneshot completion handle
//! and await it. The role lives behind an async mutex that the command loop
//! holds while dispatching and that snapshot compaction also takes, so a role
//! swap never interleaves with a log compaction.

use super::command::{Command, ProposalReply};
use super::role::{Handled, Role};
use super::rpc::*;
use super::{NodeState, StateMachine};
use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::observability;
use crate::shutdown::ShutdownSignal;
use crate::storage::{LogStore, StateManager};
use crate::types::{LogIndex, NodeId, Term};
use parking_lot::{Mutex as SyncMutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Read-only view of the engine for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub node_id: NodeId,
    pub state: NodeState,
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub leader_id: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub last_snapshot_index: LogIndex,
    pub last_snapshot_term: Term,
    /// Local compactions completed since start.
    pub snapshots_taken: u64,
}

/// A Raft node driving a replicated [`StateMachine`].
///
/// The engine does not listen on the network. A server shim forwards
/// incoming RPCs to the `handle_*` methods and a [`Cluster`] implementation
/// carries outgoing ones.
pub struct RaftEngine {
    inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    pub(crate) config: RaftConfig,
    pub(crate) log: Arc<dyn LogStore>,
    pub(crate) state: Arc<dyn StateManager>,
    pub(crate) state_machine: Arc<dyn StateMachine>,
    pub(crate) cluster: Arc<dyn Cluster>,
    /// Producer side of the command queue; `None` once closed.
    commands: RwLock<Option<mpsc::UnboundedSender<Command>>>,
    /// Consumer side, taken by the command loop on start.
    command_rx: SyncMutex<Option<mpsc::UnboundedReceiver<Command>>>,
    /// Current role. Shared by the command loop and compaction.
    pub(crate) role: Mutex<Role>,
    /// Serializes state machine access between apply, snapshot creation and restore.
    pub(crate) apply_gate: Mutex<()>,
    pub(crate) commit_index: AtomicU64,
    pub(crate) last_applied: AtomicU64,
    /// Bumped on every role entry; role events from older epochs are dropped.
    epoch: AtomicU64,
    pub(crate) snapshot_in_progress: AtomicBool,
    pub(crate) snapshots_taken: AtomicU64,
    /// Wakes the apply loop when the commit index advances.
    pub(crate) apply_notify: Notify,
    pending: SyncMutex<HashMap<LogIndex, ProposalReply>>,
    /// Mirror of the current role's kind, readable without the role lock.
    state_kind: RwLock<NodeState>,
    leader_id: RwLock<Option<NodeId>>,
    /// Root cancellation source.
    pub(crate) shutdown: ShutdownSignal,
    command_task: SyncMutex<Option<JoinHandle<()>>>,
    apply_task: SyncMutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    disposed: AtomicBool,
}

impl RaftEngine {
    /// Create an engine. Nothing runs until [`RaftEngine::start`].
    pub fn new(
        config: RaftConfig,
        log: Arc<dyn LogStore>,
        state: Arc<dyn StateManager>,
        state_machine: Arc<dyn StateMachine>,
        cluster: Arc<dyn Cluster>,
    ) -> Result<Self> {
        config.validate()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = ShutdownSignal::new();
        let initial_role = Role::initial(&config, shutdown.child());

        let inner = EngineInner {
            config,
            log,
            state,
            state_machine,
            cluster,
            commands: RwLock::new(Some(tx)),
            command_rx: SyncMutex::new(Some(rx)),
            role: Mutex::new(initial_role),
            apply_gate: Mutex::new(()),
            commit_index: AtomicU64::new(0),
            last_applied: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            snapshot_in_progress: AtomicBool::new(false),
            snapshots_taken: AtomicU64::new(0),
            apply_notify: Notify::new(),
            pending: SyncMutex::new(HashMap::new()),
            state_kind: RwLock::new(NodeState::Follower),
            leader_id: RwLock::new(None),
            shutdown,
            command_task: SyncMutex::new(None),
            apply_task: SyncMutex::new(None),
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Recover from the stored snapshot, enter Follower, and start the
    /// command and apply loops. Calling it again is a no-op; calling it after
    /// [`RaftEngine::shutdown`] fails.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::SeqCst) {
            return Err(RaftError::InvalidState(
                "Engine has been shut down".to_string(),
            ));
        }
        if inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = inner.recover().await {
            inner.started.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let rx = inner
            .command_rx
            .lock()
            .take()
            .ok_or_else(|| RaftError::Internal("Command queue already consumed".to_string()))?;

        {
            let mut role = inner.role.lock().await;
            inner
                .transition_locked(&mut role, NodeState::Follower, true)
                .await;
        }

        let command_task = tokio::spawn(Arc::clone(inner).run_command_loop(rx));
        let apply_task = tokio::spawn(Arc::clone(inner).run_apply_loop());
        *inner.command_task.lock() = Some(command_task);
        *inner.apply_task.lock() = Some(apply_task);

        info!(
            node_id = inner.config.node_id,
            peers = ?inner.config.peers,
            term = inner.state.current_term(),
            last_log_index = inner.log.last_index(),
            "Raft engine started"
        );
        Ok(())
    }

    /// Handle incoming RequestVote RPC.
    pub async fn handle_request_vote(
        &self,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let (reply, rx) = oneshot::channel();
        self.inner.enqueue(Command::RequestVote { request, reply })?;
        rx.await.map_err(|_| RaftError::shutting_down())
    }

    /// Handle incoming AppendEntries RPC.
    pub async fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let (reply, rx) = oneshot::channel();
        self.inner.enqueue(Command::AppendEntries { request, reply })?;
        rx.await.map_err(|_| RaftError::shutting_down())
    }

    /// Handle incoming InstallSnapshot RPC.
    pub async fn handle_install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let (reply, rx) = oneshot::channel();
        self.inner.enqueue(Command::InstallSnapshot { request, reply })?;
        rx.await.map_err(|_| RaftError::shutting_down())
    }

    /// Propose a command. Resolves with the state machine's result once the
    /// entry has been applied, or fails with [`RaftError::NotLeader`].
    pub async fn propose(&self, command: Vec<u8>) -> Result<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.inner.enqueue(Command::Propose { command, reply })?;
        rx.await.map_err(|_| RaftError::shutting_down())?
    }

    /// Signal an election timeout. Dropped if the engine is shutting down.
    pub fn handle_internal_timeout(&self) {
        self.inner.try_enqueue(Command::Timeout { epoch: None });
    }

    /// Report a term seen in a peer's response. Dropped if the engine is shutting down.
    pub fn process_higher_term(&self, sender: NodeId, term: Term) {
        self.inner.process_higher_term(sender, term);
    }

    /// Switch to `state` unless already in it.
    pub async fn transition_to(&self, state: NodeState) -> Result<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(RaftError::shutting_down());
        }
        let mut role = self.inner.role.lock().await;
        self.inner.transition_locked(&mut role, state, false).await;
        Ok(())
    }

    /// Advance the commit index. Smaller values are ignored.
    pub fn set_commit_index(&self, index: LogIndex) {
        self.inner.set_commit_index(index);
    }

    /// Register a completion handle for the entry at `index`.
    pub fn register_proposal(&self, index: LogIndex, reply: oneshot::Sender<Result<Vec<u8>>>) {
        self.inner.register_proposal(index, reply);
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.config.node_id
    }

    pub fn config(&self) -> &RaftConfig {
        &self.inner.config
    }

    pub fn is_leader(&self) -> bool {
        self.inner.state_kind.read().is_leader()
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.inner.leader_id()
    }

    pub fn status(&self) -> EngineStatus {
        let inner = &self.inner;
        EngineStatus {
            node_id: inner.config.node_id,
            state: *inner.state_kind.read(),
            current_term: inner.state.current_term(),
            voted_for: inner.state.voted_for(),
            leader_id: inner.leader_id(),
            commit_index: inner.commit_index(),
            last_applied: inner.last_applied(),
            last_log_index: inner.log.last_index(),
            last_snapshot_index: inner.log.last_snapshot_index(),
            last_snapshot_term: inner.log.last_snapshot_term(),
            snapshots_taken: inner.snapshots_taken.load(Ordering::SeqCst),
        }
    }

    /// Stop the engine.
    ///
    /// Cancels every task, waits for the command loop, leaves the current
    /// role, closes the queue and fails unresolved proposals with
    /// [`RaftError::ServiceUnavailable`]. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(node_id = inner.config.node_id, "Raft engine shutting down");

        inner.shutdown.trigger();

        let command_task = inner.command_task.lock().take();
        if let Some(task) = command_task {
            if let Err(e) = task.await {
                error!(node_id = inner.config.node_id, error = %e, "Command loop panicked");
            }
        }

        inner.role.lock().await.leave();
        inner.close_queue();
        inner.fail_all_proposals();

        let apply_task = inner.apply_task.lock().take();
        if let Some(task) = apply_task {
            if let Err(e) = task.await {
                error!(node_id = inner.config.node_id, error = %e, "Apply loop panicked");
            }
        }

        info!(node_id = inner.config.node_id, "Raft engine stopped");
        Ok(())
    }
}

impl Drop for RaftEngine {
    fn drop(&mut self) {
        // Background tasks hold the inner state; make sure they wind down.
        self.inner.shutdown.trigger();
    }
}

impl EngineInner {
    pub(crate) fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub(crate) fn commit_index(&self) -> LogIndex {
        self.commit_index.load(Ordering::SeqCst)
    }

    pub(crate) fn last_applied(&self) -> LogIndex {
        self.last_applied.load(Ordering::SeqCst)
    }

    pub(crate) fn leader_id(&self) -> Option<NodeId> {
        *self.leader_id.read()
    }

    pub(crate) fn set_leader(&self, leader: Option<NodeId>) {
        let mut current = self.leader_id.write();
        if *current != leader {
            debug!(node_id = self.config.node_id, leader = ?leader, "Leader changed");
            *current = leader;
        }
    }

    pub(crate) fn enqueue(&self, command: Command) -> Result<()> {
        match self.commands.read().as_ref() {
            Some(tx) => tx.send(command).map_err(|_| RaftError::shutting_down()),
            None => Err(RaftError::shutting_down()),
        }
    }

    /// Best-effort enqueue for fire-and-forget signals.
    pub(crate) fn try_enqueue(&self, command: Command) {
        let kind = command.kind();
        if self.enqueue(command).is_err() {
            debug!(node_id = self.config.node_id, kind, "Dropped command, queue closed");
        }
    }

    pub(crate) fn process_higher_term(&self, sender: NodeId, term: Term) {
        self.try_enqueue(Command::HigherTerm { sender, term });
    }

    fn close_queue(&self) {
        self.commands.write().take();
    }

    pub(crate) fn set_commit_index(&self, index: LogIndex) {
        let index = index.min(self.log.last_index());
        let previous = self.commit_index.fetch_max(index, Ordering::SeqCst);
        if index > previous {
            debug!(node_id = self.config.node_id, commit_index = index, "Commit index advanced");
            observability::record_commit(self.config.node_id, index);
            self.apply_notify.notify_one();
        }
    }

    pub(crate) fn register_proposal(&self, index: LogIndex, reply: ProposalReply) {
        let displaced = self.pending.lock().insert(index, reply);
        if let Some(previous) = displaced {
            let _ = previous.send(Err(RaftError::NotLeader {
                leader: self.leader_id(),
            }));
        }
    }

    pub(crate) fn resolve_proposal(&self, index: LogIndex, result: Result<Vec<u8>>) {
        let reply = self.pending.lock().remove(&index);
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }

    fn take_proposals<F>(&self, select: F) -> Vec<ProposalReply>
    where
        F: Fn(LogIndex) -> bool,
    {
        let mut pending = self.pending.lock();
        let indices: Vec<LogIndex> = pending.keys().copied().filter(|&i| select(i)).collect();
        indices
            .into_iter()
            .filter_map(|i| pending.remove(&i))
            .collect()
    }

    /// Fail proposals at or after `from`; their entries were replaced.
    pub(crate) fn fail_proposals_from(&self, from: LogIndex) {
        let leader = self.leader_id();
        for reply in self.take_proposals(|i| i >= from) {
            let _ = reply.send(Err(RaftError::NotLeader { leader }));
        }
    }

    /// Fail proposals at or before `through`; a snapshot from another leader covers them.
    pub(crate) fn fail_proposals_through(&self, through: LogIndex) {
        let leader = self.leader_id();
        for reply in self.take_proposals(|i| i <= through) {
            let _ = reply.send(Err(RaftError::NotLeader { leader }));
        }
    }

    fn fail_all_proposals(&self) {
        let failed = self.take_proposals(|_| true);
        if !failed.is_empty() {
            debug!(node_id = self.config.node_id, count = failed.len(), "Failing pending proposals");
        }
        for reply in failed {
            let _ = reply.send(Err(RaftError::shutting_down()));
        }
    }

    /// Restore the state machine from the stored snapshot, if any.
    async fn recover(&self) -> Result<()> {
        let snapshot_index = self.log.last_snapshot_index();
        if snapshot_index == 0 {
            return Ok(());
        }

        let _gate = self.apply_gate.lock().await;
        let data = self.log.snapshot_data().await?.ok_or_else(|| {
            RaftError::Snapshot(format!(
                "Snapshot data missing for boundary {}",
                snapshot_index
            ))
        })?;
        self.state_machine.restore_from_snapshot(&data).await?;
        self.commit_index.fetch_max(snapshot_index, Ordering::SeqCst);
        self.last_applied.fetch_max(snapshot_index, Ordering::SeqCst);

        info!(
            node_id = self.config.node_id,
            snapshot_index,
            snapshot_term = self.log.last_snapshot_term(),
            "Restored state machine from snapshot"
        );
        Ok(())
    }

    async fn run_command_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Command>) {
        debug!(node_id = self.config.node_id, "Command loop started");
        loop {
            let command = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                command = rx.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            let mut role = self.role.lock().await;
            self.dispatch(&mut role, command).await;
        }
        debug!(node_id = self.config.node_id, "Command loop stopped");
    }

    async fn dispatch(self: &Arc<Self>, role: &mut Role, command: Command) {
        if let Some(epoch) = command.epoch() {
            if epoch != role.epoch() {
                debug!(
                    node_id = self.config.node_id,
                    kind = command.kind(),
                    epoch,
                    current_epoch = role.epoch(),
                    "Dropping event from a previous role"
                );
                return;
            }
        }

        match command {
            Command::HigherTerm { sender, term } => {
                self.step_down(role, term, sender).await;
            }
            Command::RequestVote { request, reply } => {
                self.observe_term(role, request.term, request.candidate_id)
                    .await;
                let response = role.handle_request_vote(self, request).await;
                let _ = reply.send(response);
            }
            Command::AppendEntries { request, reply } => {
                self.observe_term(role, request.term, request.leader_id)
                    .await;
                let response = match role.handle_append_entries(self, request).await {
                    Handled::Done(response) => response,
                    Handled::Defer(request) => {
                        self.transition_locked(role, NodeState::Follower, false)
                            .await;
                        match role.handle_append_entries(self, request).await {
                            Handled::Done(response) => response,
                            Handled::Defer(_) => {
                                AppendEntriesResponse::rejected(self.state.current_term(), None)
                            }
                        }
                    }
                };
                let _ = reply.send(response);
            }
            Command::InstallSnapshot { request, reply } => {
                self.observe_term(role, request.term, request.leader_id)
                    .await;
                let response = match role.handle_install_snapshot(self, request).await {
                    Handled::Done(response) => response,
                    Handled::Defer(request) => {
                        self.transition_locked(role, NodeState::Follower, false)
                            .await;
                        match role.handle_install_snapshot(self, request).await {
                            Handled::Done(response) => response,
                            Handled::Defer(_) => InstallSnapshotResponse {
                                term: self.state.current_term(),
                                success: false,
                            },
                        }
                    }
                };
                let _ = reply.send(response);
            }
            Command::Propose { command, reply } => {
                role.propose(self, command, reply).await;
            }
            Command::Timeout { .. } => match role.state() {
                NodeState::Follower => {
                    info!(
                        node_id = self.config.node_id,
                        term = self.state.current_term(),
                        "Election timeout, no heartbeat from leader"
                    );
                    self.transition_locked(role, NodeState::Candidate, false)
                        .await;
                }
                NodeState::Candidate => {
                    info!(
                        node_id = self.config.node_id,
                        term = self.state.current_term(),
                        "Election timed out without a majority, retrying"
                    );
                    self.transition_locked(role, NodeState::Candidate, true)
                        .await;
                }
                NodeState::Leader => {}
            },
            Command::Heartbeat { .. } => role.on_heartbeat(self),
            Command::VoteResponse { from, response, .. } => {
                if let Some(next) = role.on_vote_response(self, from, response) {
                    self.transition_locked(role, next, false).await;
                }
            }
            Command::ReplicationResult {
                peer,
                prev_log_index,
                entry_count,
                response,
                ..
            } => role.on_replication_result(self, peer, prev_log_index, entry_count, response),
            Command::SnapshotResult {
                peer,
                last_included_index,
                response,
                ..
            } => role.on_snapshot_result(self, peer, last_included_index, response),
        }
    }

    async fn observe_term(self: &Arc<Self>, role: &mut Role, term: Term, sender: NodeId) {
        if term > self.state.current_term() {
            self.step_down(role, term, sender).await;
        }
    }

    /// Adopt `term` if it is newer and fall back to Follower.
    async fn step_down(self: &Arc<Self>, role: &mut Role, term: Term, sender: NodeId) {
        match self.state.step_down_if_greater_term(term).await {
            Ok(true) => {
                info!(
                    node_id = self.config.node_id,
                    term,
                    sender,
                    state = %role.state(),
                    "Observed higher term, stepping down"
                );
                self.set_leader(None);
                self.transition_locked(role, NodeState::Follower, false)
                    .await;
                observability::record_role(self.config.node_id, role.state(), term);
            }
            Ok(false) => {}
            Err(e) => {
                error!(
                    node_id = self.config.node_id,
                    critical = true,
                    term,
                    error = %e,
                    "Failed to persist higher term"
                );
            }
        }
    }

    /// Swap the current role for `target`. `force` re-enters even if already
    /// in `target` (a Candidate restarting its election).
    ///
    /// The caller holds the role lock.
    pub(crate) async fn transition_locked(
        self: &Arc<Self>,
        role: &mut Role,
        target: NodeState,
        force: bool,
    ) {
        let mut target = target;
        let mut force = force;
        loop {
            if !force && role.state() == target {
                return;
            }
            let from = role.state();
            role.leave();

            let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            let (entered, follow_up) = match Role::enter(self, target, epoch).await {
                Ok(entered) => entered,
                Err(e) => {
                    error!(
                        node_id = self.config.node_id,
                        critical = true,
                        target = %target,
                        error = %e,
                        "Failed to enter role, falling back to follower"
                    );
                    (Role::follower(self, epoch), None)
                }
            };
            *role = entered;
            *self.state_kind.write() = role.state();

            let term = self.state.current_term();
            info!(
                node_id = self.config.node_id,
                from = %from,
                to = %role.state(),
                term,
                "Role transition"
            );
            observability::record_role(self.config.node_id, role.state(), term);

            match follow_up {
                Some(next) => {
                    target = next;
                    force = false;
                }
                None => return,
            }
        }
    }
}
