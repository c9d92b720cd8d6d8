//! Application-facing connection.
//!
//! A [`Connection`] is what a route layer would wrap: it writes entries,
//! reads them back, opens cursors and reports on cascades. Connections are
//! cheap to clone and stay valid across pipeline restarts.

use std::sync::Arc;
use std::time::Duration;

use crate::cursor::{Cursor, CursorOptions, ReadMode};
use crate::entry::{AppendRequest, Entry, EntryId, Fields, PartitionKey, Sequence};
use crate::error::{ExecutionError, TributaryResult, ValidationError};
use crate::execution::{from_log, CascadeReport, ExecutionKey, ExecutionRecord, ExecutionStatus, EXECUTION_LOG};
use crate::pipeline::Shared;
use crate::registry::check_not_reserved;
use crate::storage::KeyFilter;

/// Handle for reading and writing a pipeline's relations.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Appends an entry to `relation`.
    ///
    /// The entry becomes the root of a new cascade.
    ///
    /// # Errors
    /// - `UnknownRelation` or `ReservedName` for a bad relation
    /// - a `ValidationError` if `fields` do not match the schema
    /// - `NotStarted` if the pipeline is not running
    /// - `StoreUnavailable` on transient store failure
    pub fn write(&self, relation: &str, fields: Fields) -> TributaryResult<Entry> {
        check_not_reserved(relation)?;
        self.shared.write(AppendRequest::new(relation, fields))
    }

    /// Like [`write`](Self::write), but replaying the same `key` returns the
    /// entry written the first time instead of appending again.
    pub fn write_idempotent(&self, relation: &str, fields: Fields, key: impl Into<String>) -> TributaryResult<Entry> {
        check_not_reserved(relation)?;
        self.shared
            .write(AppendRequest::new(relation, fields).dedup_key(key))
    }

    /// Looks up an entry by id.
    ///
    /// # Errors
    /// `EntryNotFound` if no such entry exists.
    pub fn get(&self, id: EntryId) -> TributaryResult<Entry> {
        self.shared
            .store
            .get(id)?
            .ok_or_else(|| ExecutionError::EntryNotFound { id }.into())
    }

    /// Returns the named fields of an entry.
    ///
    /// # Errors
    /// `UnknownField` if a name is not in the relation's schema.
    pub fn get_fields(&self, id: EntryId, names: &[&str]) -> TributaryResult<Fields> {
        let entry = self.get(id)?;
        let relation = self.shared.catalog.require_relation(&entry.relation)?;
        let mut out = Fields::new();
        for &name in names {
            if relation.schema.get(name).is_none() {
                return Err(ValidationError::UnknownField {
                    relation: entry.relation.clone(),
                    field: name.to_string(),
                }
                .into());
            }
            if let Some(value) = entry.fields.get(name) {
                out.insert(name.to_string(), value.clone());
            }
        }
        Ok(out)
    }

    /// Newest entry written under `key` in a keyed relation.
    pub fn latest(&self, relation: &str, key: impl Into<PartitionKey>) -> TributaryResult<Option<Entry>> {
        let definition = self.shared.catalog.require_relation(relation)?;
        if definition.key_field.is_none() {
            return Err(ValidationError::RelationNotKeyed {
                relation: relation.to_string(),
            }
            .into());
        }
        Ok(self.shared.store.latest(relation, &key.into())?)
    }

    /// Opens a cursor.
    ///
    /// # Errors
    /// `NotStarted` if the pipeline is not running.
    pub fn cursor(&self, relation: &str, options: CursorOptions) -> TributaryResult<Cursor> {
        self.shared.running()?;
        let definition = self.shared.catalog.require_relation(relation)?;
        Cursor::open(
            Arc::clone(&self.shared.store),
            &self.shared.notifier,
            definition,
            options,
        )
    }

    /// Cursor over the entries present now.
    pub fn snapshot(&self, relation: &str) -> TributaryResult<Cursor> {
        let options = CursorOptions::snapshot().batch_size(self.shared.config.cursor_batch_size);
        self.cursor(relation, options)
    }

    /// Cursor that follows new appends, from the start of the relation.
    pub fn live(&self, relation: &str) -> TributaryResult<Cursor> {
        let options = CursorOptions::live()
            .batch_size(self.shared.config.cursor_batch_size)
            .wait_timeout(self.shared.config.live_cursor_timeout);
        debug_assert_eq!(options.mode, ReadMode::Live);
        self.cursor(relation, options)
    }

    /// Current state of the cascade rooted at `root`.
    ///
    /// An id the dispatcher never saw reports as resolved with no executions.
    pub fn cascade_status(&self, root: EntryId) -> TributaryResult<CascadeReport> {
        let runtime = self.shared.running()?;
        let at = self.position_of(root)?;
        runtime.dispatcher.cascade_status(root, at)
    }

    /// Blocks until the cascade rooted at `root` resolves.
    ///
    /// # Errors
    /// `Timeout` if it is still in progress after `timeout`.
    pub fn wait_for_cascade(&self, root: EntryId, timeout: Duration) -> TributaryResult<CascadeReport> {
        let runtime = self.shared.running()?;
        let at = self.position_of(root)?;
        runtime.dispatcher.wait_for_cascade(root, at, timeout)
    }

    /// Record of `trigger` running on `entry`.
    ///
    /// Records the dispatcher no longer tracks are read back from the
    /// execution log, so terminal outcomes outlive eviction and restarts.
    pub fn execution(&self, trigger: &str, entry: EntryId) -> TributaryResult<Option<ExecutionRecord>> {
        self.shared.catalog.require_trigger(trigger)?;
        let key = ExecutionKey::new(trigger, entry);
        if let Some(record) = self.shared.running()?.dispatcher.execution(key.clone())? {
            return Ok(Some(record));
        }
        let logged = self.shared.store.latest(EXECUTION_LOG, &key.log_key())?;
        Ok(logged.as_ref().and_then(from_log))
    }

    /// Executions that ended in terminal failure, oldest first.
    ///
    /// Includes failures logged before the last restart unless a later
    /// attempt of the same execution has since been logged.
    pub fn failed_executions(&self) -> TributaryResult<Vec<ExecutionRecord>> {
        let recent = self.shared.running()?.dispatcher.failed_executions()?;
        let store = &self.shared.store;
        let filter = KeyFilter {
            field: "status".to_string(),
            key: PartitionKey::new(ExecutionStatus::Failed.name()),
        };
        let batch_size = self.shared.config.cursor_batch_size.max(1);

        let mut failed: Vec<ExecutionRecord> = Vec::new();
        let mut after = 0;
        loop {
            let rows = store.read_after(EXECUTION_LOG, after, Some(&filter), batch_size)?;
            let Some(last) = rows.last() else {
                break;
            };
            after = last.sequence;
            for row in &rows {
                let Some(record) = from_log(row) else {
                    tracing::warn!(entry = %row.id, "undecodable execution log row");
                    continue;
                };
                let current = store
                    .latest(EXECUTION_LOG, &record.key.log_key())?
                    .is_some_and(|latest| latest.id == row.id);
                if current {
                    failed.push(record);
                }
            }
            if rows.len() < batch_size {
                break;
            }
        }
        for record in recent {
            if !failed.iter().any(|f| f.key == record.key) {
                failed.push(record);
            }
        }
        Ok(failed)
    }

    /// Cancels the pending part of a cascade.
    ///
    /// Running executions finish but their outputs fire nothing further.
    /// Returns false if the cascade is unknown or already resolved.
    pub fn cancel_cascade(&self, root: EntryId) -> TributaryResult<bool> {
        self.shared.running()?.dispatcher.cancel_cascade(root)
    }

    fn position_of(&self, root: EntryId) -> TributaryResult<Option<(String, Sequence)>> {
        Ok(self
            .shared
            .store
            .get(root)?
            .map(|e| (e.relation, e.sequence)))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}
