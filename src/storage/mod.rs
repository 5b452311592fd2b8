//! Persistence interfaces consumed by the engine, and their adapters.
//!
//! The engine never touches a disk directly. It talks to a [`LogStore`]
//! (entries plus snapshot boundary) and a [`StateManager`] (current term and
//! vote). Mutations are async so that adapters may do real I/O; reads are
//! synchronous and served from memory by both bundled adapters.
//!
//! - [`MemoryStore`]: volatile, for tests and embedding.
//! - [`RocksStore`]: durable, RocksDB-backed.

mod memory;
mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, SnapshotMeta};

use crate::error::Result;
use crate::raft::LogEntry;
use crate::types::{LogIndex, NodeId, Term};

/// Durable sequence of log entries plus the snapshot boundary.
#[async_trait::async_trait]
pub trait LogStore: Send + Sync {
    /// Append one entry; its index must be `last_index() + 1`.
    async fn append(&self, entry: LogEntry) -> Result<LogIndex>;

    /// Append contiguous entries; returns the new last index.
    async fn append_entries(&self, entries: Vec<LogEntry>) -> Result<LogIndex>;

    /// Discard entries at and after `from_index` (conflict resolution).
    async fn truncate(&self, from_index: LogIndex) -> Result<()>;

    /// Get the entry at `index`, or None if it is absent or compacted away.
    fn get(&self, index: LogIndex) -> Result<Option<LogEntry>>;

    /// Term and index of the last entry (the snapshot boundary when empty).
    fn last_entry_info(&self) -> (Term, LogIndex);

    /// Persist `snapshot` and discard entries at or before `last_included_index`.
    ///
    /// Entries after `last_included_index` are retained. Stale boundaries
    /// (at or below the current one) are ignored.
    async fn compact_log(
        &self,
        snapshot: Vec<u8>,
        last_included_index: LogIndex,
        last_included_term: Term,
    ) -> Result<()>;

    /// The snapshot taken at the current boundary, if any.
    async fn snapshot_data(&self) -> Result<Option<Vec<u8>>>;

    /// Index of the last entry (the snapshot boundary when empty).
    fn last_index(&self) -> LogIndex;

    /// Index covered by the latest snapshot (0 if none).
    fn last_snapshot_index(&self) -> LogIndex;

    /// Term of the entry at the snapshot boundary.
    fn last_snapshot_term(&self) -> Term;

    /// Term of the entry at `index`, resolving 0 and the snapshot boundary.
    fn term_at(&self, index: LogIndex) -> Result<Option<Term>> {
        if index == 0 {
            return Ok(Some(0));
        }
        if index == self.last_snapshot_index() {
            return Ok(Some(self.last_snapshot_term()));
        }
        Ok(self.get(index)?.map(|e| e.term))
    }

    /// Entries in `[start, end]` that are still retained.
    fn entries(&self, start: LogIndex, end: LogIndex) -> Result<Vec<LogEntry>> {
        let start = start.max(self.last_snapshot_index() + 1);
        let end = end.min(self.last_index());
        let mut entries = Vec::new();
        for index in start..=end {
            match self.get(index)? {
                Some(entry) => entries.push(entry),
                None => break,
            }
        }
        Ok(entries)
    }
}

/// Durable current term and the vote cast in it.
#[async_trait::async_trait]
pub trait StateManager: Send + Sync {
    /// Latest term this node has seen.
    fn current_term(&self) -> Term;

    /// Set the current term; moving to a different term clears the vote.
    async fn set_current_term(&self, term: Term) -> Result<()>;

    /// Candidate voted for in the current term.
    fn voted_for(&self) -> Option<NodeId>;

    /// Record (or clear) the vote for the current term.
    async fn set_voted_for(&self, node: Option<NodeId>) -> Result<()>;

    /// Adopt `term` and clear the vote if `term` is newer. Returns true if it was.
    async fn step_down_if_greater_term(&self, term: Term) -> Result<bool>;
}
