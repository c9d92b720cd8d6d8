//! Durable storage backend.
//!
//! A store directory holds:
//!
//! ```text
//! <dir>/LOCK       exclusive process lock
//! <dir>/snapshot   last compacted image of all relations and trigger state
//! <dir>/wal        commits since that snapshot
//! ```
//!
//! Opening loads the snapshot and replays the WAL on top of it. Every
//! commit is appended to the WAL (CRC-checked, optionally fsynced) before
//! it becomes visible. [`PersistentEntryStore::compact`] folds the WAL
//! into a fresh snapshot.

mod codec;
mod file_lock;
mod snapshot;
mod store;
mod wal;

pub use file_lock::DirLock;
pub use store::{CompactionStats, PersistentEntryStore};

use std::path::Path;

use crate::error::{TributaryResult, ValidationError};

/// Persistent store settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentConfig {
    /// Fsync the WAL after every commit.
    pub sync_on_write: bool,
    /// WAL size in bytes past which compaction is advised.
    pub max_wal_size: u64,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            sync_on_write: true,
            max_wal_size: 64 * 1024 * 1024,
        }
    }
}

impl PersistentConfig {
    const MIN_WAL_SIZE: u64 = 4 * 1024;

    /// # Errors
    /// `InvalidConfig` if `max_wal_size` is below 4 KiB.
    pub fn validate(self) -> TributaryResult<Self> {
        if self.max_wal_size < Self::MIN_WAL_SIZE {
            return Err(ValidationError::InvalidConfig {
                reason: format!(
                    "max_wal_size must be at least {} bytes (got {})",
                    Self::MIN_WAL_SIZE,
                    self.max_wal_size
                ),
            }
            .into());
        }
        Ok(self)
    }
}

/// Opens or creates a persistent store in `dir`.
///
/// # Errors
/// - `InvalidConfig` for a bad configuration
/// - a storage error if the directory is locked by another process, or
///   the WAL is damaged anywhere but its tail
///
/// ```no_run
/// use std::sync::Arc;
/// use tributary::storage::persistent::{open_store, PersistentConfig};
///
/// let store = Arc::new(open_store("./pipeline-data", PersistentConfig::default())?);
/// # Ok::<(), tributary::TributaryError>(())
/// ```
pub fn open_store(dir: impl AsRef<Path>, config: PersistentConfig) -> TributaryResult<PersistentEntryStore> {
    let config = config.validate()?;
    Ok(PersistentEntryStore::open(dir.as_ref(), config)?)
}
