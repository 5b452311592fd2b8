//! Raft log implementation.

use crate::error::{RaftError, Result};
use crate::types::{LogIndex, Term};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// A single entry in the Raft log.
///
/// Uses `Arc<Vec<u8>>` for the command so that entries can be cloned into
/// AppendEntries requests without copying the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when the entry was received by the leader.
    pub term: Term,
    /// The index of this entry in the log.
    pub index: LogIndex,
    /// Opaque command for the state machine.
    #[serde(with = "arc_bytes")]
    pub command: Arc<Vec<u8>>,
}

impl LogEntry {
    /// Create a new log entry.
    pub fn new(term: Term, index: LogIndex, command: Vec<u8>) -> Self {
        Self {
            term,
            index,
            command: Arc::new(command),
        }
    }

    /// Get a reference to the command bytes.
    #[inline]
    pub fn command_bytes(&self) -> &[u8] {
        &self.command
    }
}

/// Serde helper module for Arc<Vec<u8>> serialization.
/// Serializes as raw bytes, deserializes into Arc-wrapped Vec.
mod arc_bytes {
    use serde::{Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(data: &Arc<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde_bytes::serialize(data.as_slice(), serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = serde_bytes::deserialize(deserializer)?;
        Ok(Arc::new(bytes))
    }
}

/// In-memory window over the retained part of the log.
///
/// Entries at or before the snapshot boundary are gone; the boundary's
/// index and term are kept so consistency checks against it still work.
#[derive(Debug)]
pub struct RaftLog {
    /// Retained entries, contiguous from `first_index`.
    entries: VecDeque<LogEntry>,
    /// Index of the first retained entry (snapshot index + 1).
    first_index: LogIndex,
    /// Term of the entry at `first_index - 1`.
    snapshot_term: Term,
}

impl RaftLog {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            first_index: 1,
            snapshot_term: 0,
        }
    }

    /// Create an empty log whose boundary sits at a snapshot.
    pub fn with_snapshot(snapshot_index: LogIndex, snapshot_term: Term) -> Self {
        Self {
            entries: VecDeque::new(),
            first_index: snapshot_index + 1,
            snapshot_term,
        }
    }

    /// Get the index of the last log entry (the snapshot index when empty).
    pub fn last_index(&self) -> LogIndex {
        if self.entries.is_empty() {
            self.first_index.saturating_sub(1)
        } else {
            self.first_index + self.entries.len() as u64 - 1
        }
    }

    /// Get the term of the last log entry.
    pub fn last_term(&self) -> Term {
        self.entries
            .back()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    /// Get the first retained index.
    pub fn first_index(&self) -> LogIndex {
        self.first_index
    }

    /// Index covered by the latest snapshot (0 if none).
    pub fn snapshot_index(&self) -> LogIndex {
        self.first_index - 1
    }

    /// Term of the entry at the snapshot index.
    pub fn snapshot_term(&self) -> Term {
        self.snapshot_term
    }

    /// Get the number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no entries are retained.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an entry to the log.
    pub fn append(&mut self, entry: LogEntry) -> Result<()> {
        let expected_index = self.last_index() + 1;
        if entry.index != expected_index {
            return Err(RaftError::RaftLog(format!(
                "Expected index {}, got {}",
                expected_index, entry.index
            )));
        }
        if entry.term < self.last_term() {
            return Err(RaftError::RaftLog(format!(
                "Entry {} has term {} below last term {}",
                entry.index,
                entry.term,
                self.last_term()
            )));
        }
        self.entries.push_back(entry);
        Ok(())
    }

    /// Check that `entries` can be appended in order, without mutating.
    pub fn check_append(&self, entries: &[LogEntry]) -> Result<()> {
        let mut expected_index = self.last_index() + 1;
        let mut last_term = self.last_term();
        for entry in entries {
            if entry.index != expected_index || entry.term < last_term {
                return Err(RaftError::RaftLog(format!(
                    "Entry {} (term {}) does not extend log ending at {} (term {})",
                    entry.index,
                    entry.term,
                    expected_index - 1,
                    last_term
                )));
            }
            expected_index += 1;
            last_term = entry.term;
        }
        Ok(())
    }

    /// Get an entry by index.
    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index < self.first_index || index > self.last_index() {
            return None;
        }
        let offset = (index - self.first_index) as usize;
        self.entries.get(offset)
    }

    /// Get the term at a specific index.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if index == self.first_index - 1 {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    /// Get entries in a range [start, end].
    pub fn entries_range(&self, start: LogIndex, end: LogIndex) -> Vec<LogEntry> {
        let start = start.max(self.first_index);
        let end = end.min(self.last_index());
        if start > end {
            return Vec::new();
        }
        let offset = (start - self.first_index) as usize;
        let count = (end - start + 1) as usize;
        self.entries.iter().skip(offset).take(count).cloned().collect()
    }

    /// Truncate the log from the given index (inclusive).
    /// Used when receiving conflicting entries from the leader.
    pub fn truncate_from(&mut self, index: LogIndex) {
        if index < self.first_index {
            self.entries.clear();
            return;
        }
        let keep = (index - self.first_index) as usize;
        self.entries.truncate(keep);
    }

    /// Discard entries up to and including `up_to_index` (for snapshotting).
    ///
    /// Entries after `up_to_index` are retained. If the index lies beyond the
    /// last entry the log becomes empty with its boundary at `up_to_index`.
    /// Older boundaries are ignored.
    pub fn compact(&mut self, up_to_index: LogIndex, snapshot_term: Term) {
        if up_to_index < self.first_index {
            return;
        }

        let entries_to_remove = (up_to_index - self.first_index + 1) as usize;
        for _ in 0..entries_to_remove.min(self.entries.len()) {
            self.entries.pop_front();
        }

        self.first_index = up_to_index + 1;
        self.snapshot_term = snapshot_term;
    }
}

impl Default for RaftLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Compare a candidate's last entry against ours, by term then index.
pub fn is_up_to_date(
    (our_last_term, our_last_index): (Term, LogIndex),
    last_log_index: LogIndex,
    last_log_term: Term,
) -> bool {
    if last_log_term != our_last_term {
        last_log_term > our_last_term
    } else {
        last_log_index >= our_last_index
    }
}
