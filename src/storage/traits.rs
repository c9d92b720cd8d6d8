//! Abstract entry store trait.
//!
//! The entry store is the single shared mutable resource of a pipeline. It
//! owns entry durability, sequence assignment, latest pointers and trigger
//! state. Every mutation goes through [`EntryStore::commit`], which applies a
//! whole [`WriteBatch`] or nothing.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entry::{AppendRequest, Entry, EntryId, PartitionKey, Sequence};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Transient infrastructure failure; the call may succeed if retried.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Entry not found.
    #[error("Entry not found: {0}")]
    EntryNotFound(EntryId),

    /// A guarded state write found a different version.
    #[error("State version conflict for {trigger}/{key}: expected {expected:?}, found {actual:?}")]
    StateVersionConflict {
        trigger: String,
        key: PartitionKey,
        expected: StateGuard,
        actual: Option<u64>,
    },

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl StorageError {
    /// Whether the failure is transient.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::StateVersionConflict { .. })
    }
}

/// Persistent state owned by one trigger for one partition key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredState {
    /// Incremented on every write; starts at 1.
    pub version: u64,
    /// Opaque state value.
    pub value: serde_json::Value,
}

/// Precondition for a state write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateGuard {
    /// Unconditional write.
    Any,
    /// No state may exist yet.
    Absent,
    /// The current state must have exactly this version.
    Version(u64),
}

impl StateGuard {
    /// Guard matching a previously read state.
    #[must_use]
    pub fn matching(prior: Option<&StoredState>) -> Self {
        prior.map_or(Self::Absent, |s| Self::Version(s.version))
    }

    /// True if a write guarded by `self` may replace state at version `current`.
    #[must_use]
    pub const fn admits(self, current: Option<u64>) -> bool {
        match (self, current) {
            (Self::Any, _) | (Self::Absent, None) => true,
            (Self::Version(expected), Some(actual)) => expected == actual,
            _ => false,
        }
    }
}

/// A compare-and-swap write of trigger state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateWrite {
    /// Owning trigger.
    pub trigger: String,
    /// Partition the state belongs to.
    pub key: PartitionKey,
    /// Precondition checked at commit.
    pub guard: StateGuard,
    /// `None` clears the state.
    pub value: Option<serde_json::Value>,
}

/// Appends and an optional state write, applied all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteBatch {
    /// Entries to append, in order.
    pub appends: Vec<AppendRequest>,
    /// Optional state change.
    pub state: Option<StateWrite>,
}

impl WriteBatch {
    /// True when the batch writes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.appends.is_empty() && self.state.is_none()
    }
}

/// One append as seen after commit.
#[derive(Debug, Clone, PartialEq)]
pub struct Committed {
    /// The stored entry.
    pub entry: Entry,
    /// True if the append matched an earlier `dedup_key` and nothing was written.
    pub deduplicated: bool,
}

/// Result of a successful [`EntryStore::commit`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitOutcome {
    /// One element per request, in request order.
    pub appended: Vec<Committed>,
    /// Version of the written state; `None` when no state was written or it was cleared.
    pub state_version: Option<u64>,
}

/// Restricts a read to entries with a given partition key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFilter {
    /// Field carrying the key.
    pub field: String,
    /// Key value to match.
    pub key: PartitionKey,
}

/// Storage trait for relations, entries and trigger state.
///
/// # Safety Considerations
/// - `commit` must assign sequence numbers, persist entries and move latest
///   pointers atomically; readers never observe a gap in a relation's
///   sequence space
/// - Implementations must handle concurrent access safely
pub trait EntryStore: Send + Sync {
    /// Atomically apply a batch.
    fn commit(&self, batch: WriteBatch) -> Result<CommitOutcome, StorageError>;

    /// Append a single entry.
    fn append(&self, request: AppendRequest) -> Result<Committed, StorageError> {
        let mut outcome = self.commit(WriteBatch {
            appends: vec![request],
            state: None,
        })?;
        outcome
            .appended
            .pop()
            .ok_or_else(|| StorageError::BackendError("commit returned no entry".to_string()))
    }

    /// Entries of `relation` with sequence greater than `after`, ascending, at most `limit`.
    fn read_after(
        &self,
        relation: &str,
        after: Sequence,
        filter: Option<&KeyFilter>,
        limit: usize,
    ) -> Result<Vec<Entry>, StorageError>;

    /// Point lookup by entry id.
    fn get(&self, id: EntryId) -> Result<Option<Entry>, StorageError>;

    /// Latest entry written for `key` in `relation`.
    fn latest(&self, relation: &str, key: &PartitionKey) -> Result<Option<Entry>, StorageError>;

    /// Highest sequence assigned in `relation`, 0 if empty.
    fn last_sequence(&self, relation: &str) -> Result<Sequence, StorageError>;

    /// Current state of `trigger` for `key`.
    fn get_state(&self, trigger: &str, key: &PartitionKey) -> Result<Option<StoredState>, StorageError>;

    /// Guarded state write. Returns the new version (0 after a clear).
    fn compare_and_swap_state(&self, write: StateWrite) -> Result<u64, StorageError> {
        let outcome = self.commit(WriteBatch {
            appends: Vec::new(),
            state: Some(write),
        })?;
        Ok(outcome.state_version.unwrap_or(0))
    }

    /// Unconditional state write.
    fn put_state(
        &self,
        trigger: &str,
        key: &PartitionKey,
        value: serde_json::Value,
    ) -> Result<u64, StorageError> {
        self.compare_and_swap_state(StateWrite {
            trigger: trigger.to_string(),
            key: key.clone(),
            guard: StateGuard::Any,
            value: Some(value),
        })
    }
}
