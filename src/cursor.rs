//! Read-side cursors.
//!
//! A snapshot cursor fixes its upper bound to the relation's last sequence
//! when it is opened and ends there. A live cursor keeps following the
//! relation; when it has caught up it blocks until an append wakes it or
//! its wait timeout elapses.
//!
//! Cursors only read. Dropping or cancelling one detaches it from the
//! [`AppendNotifier`] and leaves the store untouched.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::entry::{Entry, PartitionKey, Sequence};
use crate::error::{ExecutionError, TributaryResult, ValidationError};
use crate::registry::Relation;
use crate::storage::{EntryStore, KeyFilter, StorageError};

/// Default number of entries fetched per store read.
pub const DEFAULT_BATCH_SIZE: usize = 256;

/// Default time a live cursor waits for a new entry.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

type Watchers = HashMap<String, Vec<(u64, Sender<Sequence>)>>;

/// Wakes live cursors when entries are appended.
///
/// Each watcher owns a one-slot channel; a full slot already means "look
/// again", so notifications never block the writer.
#[derive(Debug, Default)]
pub struct AppendNotifier {
    watchers: Mutex<Watchers>,
    next_id: AtomicU64,
}

impl AppendNotifier {
    /// Notifier with no watchers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self, context: &'static str) -> Result<MutexGuard<'_, Watchers>, StorageError> {
        self.watchers
            .lock()
            .map_err(|_| StorageError::BackendError(format!("poisoned lock: {context}")))
    }

    /// Registers interest in `relation`.
    pub fn watch(&self, relation: &str) -> Result<(u64, Receiver<Sequence>), StorageError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(1);
        self.lock("notifier.watch")?
            .entry(relation.to_string())
            .or_default()
            .push((id, tx));
        Ok((id, rx))
    }

    /// Drops watcher `id` of `relation`.
    pub fn unwatch(&self, relation: &str, id: u64) -> Result<(), StorageError> {
        let mut watchers = self.lock("notifier.unwatch")?;
        if let Some(list) = watchers.get_mut(relation) {
            list.retain(|(w, _)| *w != id);
            if list.is_empty() {
                watchers.remove(relation);
            }
        }
        Ok(())
    }

    /// Wakes every watcher of `relation`.
    pub fn notify(&self, relation: &str, sequence: Sequence) -> Result<(), StorageError> {
        let mut watchers = self.lock("notifier.notify")?;
        if let Some(list) = watchers.get_mut(relation) {
            list.retain(|(_, tx)| match tx.try_send(sequence) {
                Ok(()) | Err(crossbeam_channel::TrySendError::Full(_)) => true,
                Err(crossbeam_channel::TrySendError::Disconnected(_)) => false,
            });
        }
        Ok(())
    }

    /// Number of registered watchers on `relation`.
    pub fn watcher_count(&self, relation: &str) -> Result<usize, StorageError> {
        Ok(self
            .lock("notifier.watcher_count")?
            .get(relation)
            .map_or(0, Vec::len))
    }
}

/// Whether a cursor stops at the end of the relation or keeps following it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Upper bound fixed at creation.
    Snapshot,
    /// Follows new appends.
    Live,
}

/// How to open a cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorOptions {
    /// Snapshot or live.
    pub mode: ReadMode,
    /// Start after this sequence; 0 reads from the beginning.
    pub after: Sequence,
    /// Only entries whose key field equals this key.
    pub partition: Option<PartitionKey>,
    /// Entries fetched per store read.
    pub batch_size: usize,
    /// How long a live cursor blocks when caught up.
    pub wait_timeout: Duration,
}

impl Default for CursorOptions {
    fn default() -> Self {
        Self {
            mode: ReadMode::Snapshot,
            after: 0,
            partition: None,
            batch_size: DEFAULT_BATCH_SIZE,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

impl CursorOptions {
    /// Options for a snapshot cursor.
    #[must_use]
    pub fn snapshot() -> Self {
        Self::default()
    }

    /// Options for a live cursor.
    #[must_use]
    pub fn live() -> Self {
        Self {
            mode: ReadMode::Live,
            ..Self::default()
        }
    }

    /// Starts after `sequence`.
    #[must_use]
    pub fn after(mut self, sequence: Sequence) -> Self {
        self.after = sequence;
        self
    }

    /// Restricts the cursor to one key.
    #[must_use]
    pub fn partition(mut self, key: impl Into<PartitionKey>) -> Self {
        self.partition = Some(key.into());
        self
    }

    /// Sets the per-read batch size; at least 1.
    #[must_use]
    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    /// Sets how long a caught-up live cursor blocks.
    #[must_use]
    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }
}

struct Watch {
    notifier: Arc<AppendNotifier>,
    id: u64,
    wake: Receiver<Sequence>,
}

/// Ordered read handle over one relation.
pub struct Cursor {
    store: Arc<dyn EntryStore>,
    relation: String,
    filter: Option<KeyFilter>,
    mode: ReadMode,
    position: Sequence,
    upper: Option<Sequence>,
    buffer: VecDeque<Entry>,
    batch_size: usize,
    wait_timeout: Duration,
    watch: Option<Watch>,
    exhausted: bool,
}

impl Cursor {
    /// Opens a cursor on `relation`.
    ///
    /// # Errors
    /// `RelationNotKeyed` if a partition is requested on an unkeyed relation.
    pub fn open(
        store: Arc<dyn EntryStore>,
        notifier: &Arc<AppendNotifier>,
        relation: &Relation,
        options: CursorOptions,
    ) -> TributaryResult<Self> {
        let filter = match options.partition {
            Some(key) => {
                let field = relation
                    .key_field
                    .clone()
                    .ok_or_else(|| ValidationError::RelationNotKeyed {
                        relation: relation.name.clone(),
                    })?;
                Some(KeyFilter { field, key })
            }
            None => None,
        };

        // Register before the first read so no append can slip between.
        let watch = match options.mode {
            ReadMode::Live => {
                let (id, wake) = notifier.watch(&relation.name)?;
                Some(Watch {
                    notifier: Arc::clone(notifier),
                    id,
                    wake,
                })
            }
            ReadMode::Snapshot => None,
        };

        let upper = match options.mode {
            ReadMode::Snapshot => Some(store.last_sequence(&relation.name)?),
            ReadMode::Live => None,
        };

        Ok(Self {
            store,
            relation: relation.name.clone(),
            filter,
            mode: options.mode,
            position: options.after,
            upper,
            buffer: VecDeque::new(),
            batch_size: options.batch_size.max(1),
            wait_timeout: options.wait_timeout,
            watch,
            exhausted: false,
        })
    }

    /// Relation being read.
    #[must_use]
    pub fn relation(&self) -> &str {
        &self.relation
    }

    /// Snapshot or live.
    #[must_use]
    pub fn mode(&self) -> ReadMode {
        self.mode
    }

    /// Sequence of the last entry returned (or the starting point).
    #[must_use]
    pub fn position(&self) -> Sequence {
        self.position
    }

    /// Fixed upper bound of a snapshot cursor.
    #[must_use]
    pub fn upper_bound(&self) -> Option<Sequence> {
        self.upper
    }

    fn fill(&mut self) -> TributaryResult<()> {
        let after = self.buffer.back().map_or(self.position, |e| e.sequence);
        if self.upper.is_some_and(|upper| after >= upper) {
            return Ok(());
        }
        let batch = self
            .store
            .read_after(&self.relation, after, self.filter.as_ref(), self.batch_size)?;
        let upper = self.upper;
        self.buffer.extend(
            batch
                .into_iter()
                .take_while(|e| upper.map_or(true, |u| e.sequence <= u)),
        );
        Ok(())
    }

    /// Returns the next entry in sequence order.
    ///
    /// Snapshot cursors return `Ok(None)` once past their upper bound. Live
    /// cursors block up to the wait timeout and return `Ok(None)` if nothing
    /// arrived; calling again resumes.
    pub fn next_entry(&mut self) -> TributaryResult<Option<Entry>> {
        let deadline = Instant::now() + self.wait_timeout;
        loop {
            if let Some(entry) = self.buffer.pop_front() {
                self.position = entry.sequence;
                return Ok(Some(entry));
            }
            if self.exhausted {
                return Ok(None);
            }

            self.fill()?;
            if !self.buffer.is_empty() {
                continue;
            }

            let Some(watch) = &self.watch else {
                self.exhausted = true;
                return Ok(None);
            };
            match watch.wake.recv_deadline(deadline) {
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ExecutionError::disconnected("cursor.wake").into());
                }
            }
        }
    }

    /// Detaches the cursor.
    pub fn cancel(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(watch) = self.watch.take() {
            if let Err(e) = watch.notifier.unwatch(&self.relation, watch.id) {
                tracing::warn!(relation = %self.relation, error = %e, "cursor detach failed");
            }
        }
        self.buffer.clear();
        self.exhausted = true;
    }
}

impl Iterator for Cursor {
    type Item = TributaryResult<Entry>;

    /// Ends when a snapshot is exhausted or a live cursor times out.
    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("relation", &self.relation)
            .field("mode", &self.mode)
            .field("position", &self.position)
            .field("upper", &self.upper)
            .finish_non_exhaustive()
    }
}
