//! RocksDB-backed log store and state manager.

use super::{LogStore, StateManager};
use crate::error::{RaftError, Result};
use crate::raft::{LogEntry, PersistentState, RaftLog};
use crate::types::{LogIndex, NodeId, Term};
use parking_lot::RwLock;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

const PERSISTENT_STATE_KEY: &[u8] = b"raft_persistent_state";
const LOG_PREFIX: &[u8] = b"raft_log_";
const SNAPSHOT_KEY: &[u8] = b"raft_snapshot";
const SNAPSHOT_META_KEY: &[u8] = b"raft_snapshot_meta";

/// Snapshot metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_index: LogIndex,
    pub last_term: Term,
}

/// Durable [`LogStore`] and [`StateManager`] over a single RocksDB instance.
///
/// Every mutation hits the database before the in-memory view is updated,
/// so reads never observe state that a crash could lose.
pub struct RocksStore {
    db: DB,
    log: RwLock<RaftLog>,
    state: RwLock<PersistentState>,
}

impl RocksStore {
    /// Open or create a store at the given path and load what it holds.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path)?;

        let state = match db.get(PERSISTENT_STATE_KEY)? {
            Some(data) => bincode::deserialize::<PersistentState>(&data)?,
            None => PersistentState::new(),
        };
        let meta = match db.get(SNAPSHOT_META_KEY)? {
            Some(data) => bincode::deserialize::<SnapshotMeta>(&data)?,
            None => SnapshotMeta::default(),
        };

        let mut log = RaftLog::with_snapshot(meta.last_index, meta.last_term);
        for entry in load_entries_from(&db, meta.last_index + 1)? {
            log.append(entry)
                .map_err(|e| RaftError::Storage(format!("Corrupt log on disk: {}", e)))?;
        }

        info!(
            term = state.current_term,
            snapshot_index = meta.last_index,
            last_index = log.last_index(),
            "Opened raft store"
        );

        Ok(Self {
            db,
            log: RwLock::new(log),
            state: RwLock::new(state),
        })
    }

    /// Metadata of the stored snapshot, if one exists.
    pub fn snapshot_meta(&self) -> Result<Option<SnapshotMeta>> {
        match self.db.get(SNAPSHOT_META_KEY)? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    fn save_state(&self, state: &PersistentState) -> Result<()> {
        let data = bincode::serialize(state)?;
        self.db.put(PERSISTENT_STATE_KEY, data)?;
        self.db.flush()?;
        Ok(())
    }

    fn write_entries(&self, entries: &[LogEntry]) -> Result<()> {
        let mut batch = WriteBatch::default();
        for entry in entries {
            batch.put(log_key(entry.index), bincode::serialize(entry)?);
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// Delete stored entries in `[from, to)`.
    fn delete_entries(&self, batch: &mut WriteBatch, from: LogIndex, to: Option<LogIndex>) -> Result<()> {
        let end_key = to.map(log_key);
        let start_key = log_key(from);
        let iter = self
            .db
            .iterator(IteratorMode::From(&start_key, Direction::Forward));

        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(LOG_PREFIX) {
                break;
            }
            if let Some(end) = &end_key {
                if key.as_ref() >= end.as_slice() {
                    break;
                }
            }
            batch.delete(&key);
        }
        Ok(())
    }
}

fn log_key(index: LogIndex) -> Vec<u8> {
    let mut key = LOG_PREFIX.to_vec();
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn load_entries_from(db: &DB, start_index: LogIndex) -> Result<Vec<LogEntry>> {
    let mut entries = Vec::new();
    let start_key = log_key(start_index);
    let iter = db.iterator(IteratorMode::From(&start_key, Direction::Forward));

    for item in iter {
        let (key, value) = item?;
        if !key.starts_with(LOG_PREFIX) {
            break;
        }
        entries.push(bincode::deserialize::<LogEntry>(&value)?);
    }
    Ok(entries)
}

#[async_trait::async_trait]
impl LogStore for RocksStore {
    async fn append(&self, entry: LogEntry) -> Result<LogIndex> {
        let mut log = self.log.write();
        log.check_append(std::slice::from_ref(&entry))?;
        self.write_entries(std::slice::from_ref(&entry))?;
        let index = entry.index;
        log.append(entry)?;
        Ok(index)
    }

    async fn append_entries(&self, entries: Vec<LogEntry>) -> Result<LogIndex> {
        let mut log = self.log.write();
        log.check_append(&entries)?;
        self.write_entries(&entries)?;
        for entry in entries {
            log.append(entry)?;
        }
        Ok(log.last_index())
    }

    async fn truncate(&self, from_index: LogIndex) -> Result<()> {
        let mut log = self.log.write();
        let from = from_index.max(log.first_index());
        let mut batch = WriteBatch::default();
        self.delete_entries(&mut batch, from, None)?;
        self.db.write(batch)?;
        log.truncate_from(from);
        debug!(from_index = from, "Truncated log");
        Ok(())
    }

    fn get(&self, index: LogIndex) -> Result<Option<LogEntry>> {
        Ok(self.log.read().get(index).cloned())
    }

    fn last_entry_info(&self) -> (Term, LogIndex) {
        let log = self.log.read();
        (log.last_term(), log.last_index())
    }

    async fn compact_log(
        &self,
        snapshot: Vec<u8>,
        last_included_index: LogIndex,
        last_included_term: Term,
    ) -> Result<()> {
        let mut log = self.log.write();
        if last_included_index <= log.snapshot_index() {
            return Ok(());
        }

        let meta = SnapshotMeta {
            last_index: last_included_index,
            last_term: last_included_term,
        };
        let mut batch = WriteBatch::default();
        batch.put(SNAPSHOT_KEY, &snapshot);
        batch.put(SNAPSHOT_META_KEY, bincode::serialize(&meta)?);
        self.delete_entries(&mut batch, log.first_index(), Some(last_included_index + 1))?;
        self.db.write(batch)?;
        self.db.flush()?;

        log.compact(last_included_index, last_included_term);
        info!(
            last_included_index,
            last_included_term,
            retained = log.len(),
            "Compacted log"
        );
        Ok(())
    }

    async fn snapshot_data(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(SNAPSHOT_KEY)?)
    }

    fn last_index(&self) -> LogIndex {
        self.log.read().last_index()
    }

    fn last_snapshot_index(&self) -> LogIndex {
        self.log.read().snapshot_index()
    }

    fn last_snapshot_term(&self) -> Term {
        self.log.read().snapshot_term()
    }

    fn term_at(&self, index: LogIndex) -> Result<Option<Term>> {
        Ok(self.log.read().term_at(index))
    }

    fn entries(&self, start: LogIndex, end: LogIndex) -> Result<Vec<LogEntry>> {
        Ok(self.log.read().entries_range(start, end))
    }
}

#[async_trait::async_trait]
impl StateManager for RocksStore {
    fn current_term(&self) -> Term {
        self.state.read().current_term
    }

    async fn set_current_term(&self, term: Term) -> Result<()> {
        let mut state = self.state.write();
        if state.current_term == term {
            return Ok(());
        }
        let next = PersistentState {
            current_term: term,
            voted_for: None,
        };
        self.save_state(&next)?;
        *state = next;
        Ok(())
    }

    fn voted_for(&self) -> Option<NodeId> {
        self.state.read().voted_for
    }

    async fn set_voted_for(&self, node: Option<NodeId>) -> Result<()> {
        let mut state = self.state.write();
        let next = PersistentState {
            current_term: state.current_term,
            voted_for: node,
        };
        self.save_state(&next)?;
        *state = next;
        Ok(())
    }

    async fn step_down_if_greater_term(&self, term: Term) -> Result<bool> {
        let mut state = self.state.write();
        let mut next = state.clone();
        if !next.observe_term(term) {
            return Ok(false);
        }
        self.save_state(&next)?;
        *state = next;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_persistent_state_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = RocksStore::open(dir.path()).unwrap();
            assert_eq!(store.current_term(), 0);
            store.set_current_term(5).await.unwrap();
            store.set_voted_for(Some(3)).await.unwrap();
        }

        let store = RocksStore::open(dir.path()).unwrap();
        assert_eq!(store.current_term(), 5);
        assert_eq!(store.voted_for(), Some(3));

        assert!(store.step_down_if_greater_term(6).await.unwrap());
        assert_eq!(store.voted_for(), None);
    }

    #[tokio::test]
    async fn test_log_entries() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();

        let entries = vec![
            LogEntry::new(1, 1, vec![1, 2, 3]),
            LogEntry::new(1, 2, vec![4, 5, 6]),
            LogEntry::new(2, 3, vec![7, 8, 9]),
        ];
        assert_eq!(store.append_entries(entries).await.unwrap(), 3);

        let entry = store.get(2).unwrap().unwrap();
        assert_eq!(entry.term, 1);
        assert_eq!(entry.command_bytes(), &[4, 5, 6]);
        assert_eq!(store.last_entry_info(), (2, 3));

        // Gap is refused and nothing is written
        assert!(store.append(LogEntry::new(2, 5, vec![])).await.is_err());
        assert_eq!(store.last_index(), 3);
    }

    #[tokio::test]
    async fn test_truncate_is_durable() {
        let dir = tempdir().unwrap();
        {
            let store = RocksStore::open(dir.path()).unwrap();
            for i in 1..=3 {
                store.append(LogEntry::new(1, i, vec![i as u8])).await.unwrap();
            }
            store.truncate(2).await.unwrap();
            assert_eq!(store.last_index(), 1);
        }

        let store = RocksStore::open(dir.path()).unwrap();
        assert_eq!(store.last_index(), 1);
        assert!(store.get(2).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_compaction_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = RocksStore::open(dir.path()).unwrap();
            for i in 1..=5 {
                store.append(LogEntry::new(1, i, vec![i as u8])).await.unwrap();
            }
            store.compact_log(b"image".to_vec(), 3, 1).await.unwrap();
            assert!(store.get(3).unwrap().is_none());
            assert_eq!(store.get(4).unwrap().unwrap().command_bytes(), &[4]);
        }

        let store = RocksStore::open(dir.path()).unwrap();
        assert_eq!(store.last_snapshot_index(), 3);
        assert_eq!(store.last_snapshot_term(), 1);
        assert_eq!(store.last_index(), 5);
        assert!(store.get(2).unwrap().is_none());
        assert_eq!(store.get(5).unwrap().unwrap().command_bytes(), &[5]);
        assert_eq!(store.snapshot_data().await.unwrap(), Some(b"image".to_vec()));
        assert_eq!(
            store.snapshot_meta().unwrap(),
            Some(SnapshotMeta {
                last_index: 3,
                last_term: 1
            })
        );
    }

    #[tokio::test]
    async fn test_compaction_past_log_end() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        store.append(LogEntry::new(1, 1, vec![])).await.unwrap();

        store.compact_log(b"remote".to_vec(), 10, 4).await.unwrap();
        assert_eq!(store.last_index(), 10);
        assert_eq!(store.last_entry_info(), (4, 10));
        assert_eq!(store.append(LogEntry::new(4, 11, vec![])).await.unwrap(), 11);
    }
}
