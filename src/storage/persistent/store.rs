//! Durable entry store.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::entry::{Entry, EntryId, PartitionKey, Sequence};
use crate::storage::index::EntryIndex;
use crate::storage::traits::{
    CommitOutcome, EntryStore, KeyFilter, StorageError, StoredState, WriteBatch,
};

use super::file_lock::DirLock;
use super::wal::WriteAheadLog;
use super::{snapshot, PersistentConfig};

const WAL_FILE: &str = "wal";

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

fn io_err(context: &str, e: &std::io::Error) -> StorageError {
    StorageError::BackendError(format!("{context}: {e}"))
}

/// Outcome of [`PersistentEntryStore::compact`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionStats {
    /// Entries written into the snapshot.
    pub entries: usize,
    /// WAL size before compaction.
    pub wal_bytes_before: u64,
    /// WAL size after compaction.
    pub wal_bytes_after: u64,
    /// Size of the new snapshot file.
    pub snapshot_bytes: u64,
}

/// Entry store backed by a snapshot plus a write-ahead log.
///
/// Reads are served from memory. A commit is logged before it becomes
/// visible, under the same lock that applies it, so the log order is the
/// commit order.
#[derive(Debug)]
pub struct PersistentEntryStore {
    dir: PathBuf,
    config: PersistentConfig,
    wal: WriteAheadLog,
    index: RwLock<EntryIndex>,
    _lock: DirLock,
}

impl PersistentEntryStore {
    pub(crate) fn open(dir: &Path, config: PersistentConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(dir).map_err(|e| io_err("failed to create store directory", &e))?;
        let lock = DirLock::acquire(dir).map_err(|e| io_err("failed to lock store directory", &e))?;

        let (mut index, base) = match snapshot::load(dir).map_err(|e| io_err("failed to load snapshot", &e))? {
            Some(s) => {
                tracing::info!(
                    dir = %dir.display(),
                    entries = s.index.entry_count(),
                    taken_at = %s.taken_at,
                    "loaded snapshot"
                );
                (s.index, s.wal_sequence)
            }
            None => (EntryIndex::new(), 0),
        };

        let (wal, records) = WriteAheadLog::open(&dir.join(WAL_FILE), config.sync_on_write, base)
            .map_err(|e| io_err("failed to open WAL", &e))?;
        let mut replayed = 0usize;
        for record in records {
            // Already in the snapshot; left behind by a compaction that
            // stopped before truncating the log.
            if record.sequence <= base {
                continue;
            }
            let sequence = record.sequence;
            index.apply(record.commit).map_err(|e| {
                StorageError::BackendError(format!("failed to replay WAL record {sequence}: {e}"))
            })?;
            replayed += 1;
        }
        if replayed > 0 {
            tracing::info!(dir = %dir.display(), records = replayed, "replayed WAL");
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            wal,
            index: RwLock::new(index),
            _lock: lock,
        })
    }

    /// Data directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current WAL size in bytes.
    pub fn wal_size(&self) -> Result<u64, StorageError> {
        self.wal.size().map_err(|e| io_err("failed to read WAL size", &e))
    }

    /// Whether the WAL has outgrown `max_wal_size`.
    pub fn needs_compaction(&self) -> Result<bool, StorageError> {
        Ok(self.wal_size()? >= self.config.max_wal_size)
    }

    /// Writes a snapshot of everything committed so far and empties the WAL.
    ///
    /// Commits wait while the snapshot is written. A crash at any point
    /// leaves a directory that reopens to the same contents.
    pub fn compact(&self) -> Result<CompactionStats, StorageError> {
        let index = self.index.write().map_err(|_| lock_err("entry.compact"))?;
        let wal_bytes_before = self.wal_size()?;
        let sequence = self
            .wal
            .sequence()
            .map_err(|e| io_err("failed to read WAL sequence", &e))?;

        let snapshot_bytes = snapshot::write(&self.dir, sequence, &index)
            .map_err(|e| io_err("failed to write snapshot", &e))?;
        self.wal
            .truncate()
            .map_err(|e| io_err("failed to truncate WAL", &e))?;

        let stats = CompactionStats {
            entries: index.entry_count(),
            wal_bytes_before,
            wal_bytes_after: self.wal_size()?,
            snapshot_bytes,
        };
        tracing::info!(
            dir = %self.dir.display(),
            entries = stats.entries,
            wal_bytes_before = stats.wal_bytes_before,
            snapshot_bytes = stats.snapshot_bytes,
            "compacted store"
        );
        Ok(stats)
    }
}

impl EntryStore for PersistentEntryStore {
    fn commit(&self, batch: WriteBatch) -> Result<CommitOutcome, StorageError> {
        let mut index = self.index.write().map_err(|_| lock_err("entry.commit"))?;
        let (record, outcome) = index.prepare(batch)?;
        if record.is_empty() {
            return Ok(outcome);
        }
        self.wal
            .append(&record)
            .map_err(|e| StorageError::Unavailable(format!("WAL append failed: {e}")))?;
        index.apply(record)?;
        Ok(outcome)
    }

    fn read_after(
        &self,
        relation: &str,
        after: Sequence,
        filter: Option<&KeyFilter>,
        limit: usize,
    ) -> Result<Vec<Entry>, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("entry.read_after"))?;
        Ok(index.read_after(relation, after, filter, limit))
    }

    fn get(&self, id: EntryId) -> Result<Option<Entry>, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("entry.get"))?;
        Ok(index.get(id))
    }

    fn latest(&self, relation: &str, key: &PartitionKey) -> Result<Option<Entry>, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("entry.latest"))?;
        Ok(index.latest(relation, key))
    }

    fn last_sequence(&self, relation: &str) -> Result<Sequence, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("entry.last_sequence"))?;
        Ok(index.last_sequence(relation))
    }

    fn get_state(&self, trigger: &str, key: &PartitionKey) -> Result<Option<StoredState>, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("state.get"))?;
        Ok(index.get_state(trigger, key).cloned())
    }
}
