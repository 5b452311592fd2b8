//! Volatile log store and state manager.

use super::{LogStore, StateManager};
use crate::error::Result;
use crate::raft::{LogEntry, PersistentState, RaftLog};
use crate::types::{LogIndex, NodeId, Term};
use parking_lot::RwLock;

/// Log plus the snapshot taken at its boundary, updated together.
#[derive(Debug, Default)]
struct LogState {
    log: RaftLog,
    snapshot: Option<Vec<u8>>,
}

/// In-memory implementation of [`LogStore`] and [`StateManager`].
///
/// Nothing survives the process; use [`super::RocksStore`] for durability.
#[derive(Debug, Default)]
pub struct MemoryStore {
    log: RwLock<LogState>,
    state: RwLock<PersistentState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl LogStore for MemoryStore {
    async fn append(&self, entry: LogEntry) -> Result<LogIndex> {
        let mut guard = self.log.write();
        let index = entry.index;
        guard.log.append(entry)?;
        Ok(index)
    }

    async fn append_entries(&self, entries: Vec<LogEntry>) -> Result<LogIndex> {
        let mut guard = self.log.write();
        guard.log.check_append(&entries)?;
        for entry in entries {
            guard.log.append(entry)?;
        }
        Ok(guard.log.last_index())
    }

    async fn truncate(&self, from_index: LogIndex) -> Result<()> {
        self.log.write().log.truncate_from(from_index);
        Ok(())
    }

    fn get(&self, index: LogIndex) -> Result<Option<LogEntry>> {
        Ok(self.log.read().log.get(index).cloned())
    }

    fn last_entry_info(&self) -> (Term, LogIndex) {
        let guard = self.log.read();
        (guard.log.last_term(), guard.log.last_index())
    }

    async fn compact_log(
        &self,
        snapshot: Vec<u8>,
        last_included_index: LogIndex,
        last_included_term: Term,
    ) -> Result<()> {
        let mut guard = self.log.write();
        if last_included_index <= guard.log.snapshot_index() {
            return Ok(());
        }
        guard.log.compact(last_included_index, last_included_term);
        guard.snapshot = Some(snapshot);
        Ok(())
    }

    async fn snapshot_data(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.log.read().snapshot.clone())
    }

    fn last_index(&self) -> LogIndex {
        self.log.read().log.last_index()
    }

    fn last_snapshot_index(&self) -> LogIndex {
        self.log.read().log.snapshot_index()
    }

    fn last_snapshot_term(&self) -> Term {
        self.log.read().log.snapshot_term()
    }

    fn term_at(&self, index: LogIndex) -> Result<Option<Term>> {
        Ok(self.log.read().log.term_at(index))
    }

    fn entries(&self, start: LogIndex, end: LogIndex) -> Result<Vec<LogEntry>> {
        Ok(self.log.read().log.entries_range(start, end))
    }
}

#[async_trait::async_trait]
impl StateManager for MemoryStore {
    fn current_term(&self) -> Term {
        self.state.read().current_term
    }

    async fn set_current_term(&self, term: Term) -> Result<()> {
        let mut state = self.state.write();
        if state.current_term != term {
            state.current_term = term;
            state.voted_for = None;
        }
        Ok(())
    }

    fn voted_for(&self) -> Option<NodeId> {
        self.state.read().voted_for
    }

    async fn set_voted_for(&self, node: Option<NodeId>) -> Result<()> {
        self.state.write().voted_for = node;
        Ok(())
    }

    async fn step_down_if_greater_term(&self, term: Term) -> Result<bool> {
        Ok(self.state.write().observe_term(term))
    }
}
