//! In-memory storage backend.
//!
//! This module provides a thread-safe in-memory implementation of the storage trait.
//! It is intended for embedded usage, tests, and as a reference implementation.

use std::sync::RwLock;

use crate::entry::{Entry, EntryId, PartitionKey, Sequence};
use crate::storage::index::EntryIndex;
use crate::storage::traits::{
    CommitOutcome, EntryStore, KeyFilter, StorageError, StoredState, WriteBatch,
};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// Thread-safe in-memory entry store.
///
/// A single lock covers every relation, so a commit's sequence assignment,
/// entry insertion and latest-pointer update are observed together.
#[derive(Debug, Default)]
pub struct InMemoryEntryStore {
    index: RwLock<EntryIndex>,
}

impl InMemoryEntryStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of entries across all relations.
    pub fn len(&self) -> Result<usize, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("entry.len"))?;
        Ok(index.entry_count())
    }

    /// True when no entry has been written.
    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }
}

impl EntryStore for InMemoryEntryStore {
    fn commit(&self, batch: WriteBatch) -> Result<CommitOutcome, StorageError> {
        let mut index = self.index.write().map_err(|_| lock_err("entry.commit"))?;
        index.commit(batch)
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
