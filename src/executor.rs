//! Trigger executor.
//!
//! [`Executor::run`] is the pure step: it calls the trigger with the input
//! entry and prior state and checks everything the trigger produced.
//! [`Executor::execute`] wraps it with the store: it loads state, runs, and
//! commits every output, the state change and the execution log row as one
//! batch, so a failed or cancelled attempt leaves no partial output behind.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::catalog::Catalog;
use crate::cursor::AppendNotifier;
use crate::entry::{AppendRequest, Entry, EntryId, PartitionKey, Provenance};
use crate::execution::{log_append, ExecutionFailure, ExecutionRecord};
use crate::storage::{EntryStore, StateGuard, StateWrite, StorageError, StoredState, WriteBatch};
use crate::trigger::{StateUpdate, Trigger, TriggerError, TriggerInput};

/// Checked result of one invocation, not yet committed.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    /// Output entries to commit, in emission order.
    pub appends: Vec<AppendRequest>,
    /// State change requested by the trigger.
    pub state: StateUpdate,
}

/// Deterministic dedup key of output `index` of `trigger` applied to `entry`.
///
/// A retried execution that re-emits the same outputs hits the same keys,
/// so an attempt whose commit landed is never written twice.
#[must_use]
pub fn output_dedup_key(trigger: &str, entry: EntryId, index: usize) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(trigger.as_bytes());
    hasher.update(&[0]);
    hasher.update(entry.as_uuid().as_bytes());
    hasher.update(&(index as u64).to_le_bytes());
    hasher.finalize().to_hex().to_string()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn storage_failure(err: &StorageError, attempt: u32) -> ExecutionFailure {
    match err {
        StorageError::SerializationError(_) => ExecutionFailure::fatal(err.to_string(), attempt),
        _ => ExecutionFailure::retryable(err.to_string(), attempt),
    }
}

/// Runs triggers against the shared store.
pub struct Executor {
    catalog: Arc<Catalog>,
    store: Arc<dyn EntryStore>,
    notifier: Arc<AppendNotifier>,
}

impl Executor {
    /// Executor over `catalog` writing to `store`.
    pub fn new(catalog: Arc<Catalog>, store: Arc<dyn EntryStore>, notifier: Arc<AppendNotifier>) -> Self {
        Self {
            catalog,
            store,
            notifier,
        }
    }

    /// Invokes `trigger` on `entry` and validates the result.
    ///
    /// # Errors
    /// - `Fatal` for writes to undeclared relations, outputs violating the
    ///   target schema, state kept by a stateless trigger, or a panic
    /// - the trigger's own classification for errors it returns
    pub fn run(
        &self,
        trigger: &Trigger,
        entry: &Entry,
        key: &PartitionKey,
        prior: Option<&StoredState>,
        attempt: u32,
    ) -> Result<Invocation, ExecutionFailure> {
        let input = TriggerInput {
            entry,
            key,
            state: prior.map(|s| &s.value),
            attempt,
        };

        let output = match panic::catch_unwind(AssertUnwindSafe(|| trigger.handler().call(&input))) {
            Ok(Ok(output)) => output,
            Ok(Err(TriggerError::Retryable { message })) => {
                return Err(ExecutionFailure::retryable(message, attempt));
            }
            Ok(Err(TriggerError::Fatal { message })) => {
                return Err(ExecutionFailure::fatal(message, attempt));
            }
            Err(payload) => {
                return Err(ExecutionFailure::fatal(
                    format!("trigger panicked: {}", panic_message(payload.as_ref())),
                    attempt,
                ));
            }
        };

        if !trigger.is_stateful() && output.state != StateUpdate::Keep {
            return Err(ExecutionFailure::fatal(
                "stateless trigger returned a state update",
                attempt,
            ));
        }

        let provenance = Provenance {
            caused_by: entry.id,
            root: entry.root,
        };
        let mut appends = Vec::with_capacity(output.emits.len());
        for (index, (relation, fields)) in output.emits.into_iter().enumerate() {
            if !trigger.writes(&relation) {
                return Err(ExecutionFailure::fatal(
                    format!("write to undeclared relation '{relation}'"),
                    attempt,
                ));
            }
            let target = self.catalog.relation(&relation).ok_or_else(|| {
                ExecutionFailure::fatal(format!("unknown relation '{relation}'"), attempt)
            })?;
            if let Err(e) = target.validate(&fields) {
                return Err(ExecutionFailure::fatal(
                    format!("output {index} violates schema: {e}"),
                    attempt,
                ));
            }
            let latest = target.key_for(&fields);
            let dedup_key = output_dedup_key(trigger.name(), entry.id, index);
            appends.push(
                AppendRequest::new(relation, fields)
                    .caused_by(provenance)
                    .with_id(EntryId::derived(&dedup_key))
                    .dedup_key(dedup_key)
                    .latest_key(latest),
            );
        }

        Ok(Invocation {
            appends,
            state: output.state,
        })
    }

    /// Runs one attempt of `record` and commits its effects.
    ///
    /// `record` is the running snapshot taken when the attempt was
    /// dispatched. Outputs, the state change and the execution log row for
    /// the succeeded record commit as one batch. Returns the committed
    /// output entries in emission order.
    pub fn execute(&self, record: &ExecutionRecord, entry: &Entry) -> Result<Vec<Entry>, ExecutionFailure> {
        let attempt = record.attempts;
        let key = &record.partition;
        let trigger = self.catalog.trigger(&record.key.trigger).ok_or_else(|| {
            ExecutionFailure::fatal(format!("unknown trigger '{}'", record.key.trigger), attempt)
        })?;

        let prior = if trigger.is_stateful() {
            self.store
                .get_state(trigger.name(), key)
                .map_err(|e| storage_failure(&e, attempt))?
        } else {
            None
        };

        let invocation = self.run(trigger, entry, key, prior.as_ref(), attempt)?;

        let state = match invocation.state {
            StateUpdate::Keep => None,
            StateUpdate::Set(value) => Some(StateWrite {
                trigger: trigger.name().to_string(),
                key: key.clone(),
                guard: StateGuard::matching(prior.as_ref()),
                value: Some(value),
            }),
            StateUpdate::Clear => prior.as_ref().map(|p| StateWrite {
                trigger: trigger.name().to_string(),
                key: key.clone(),
                guard: StateGuard::Version(p.version),
                value: None,
            }),
        };

        let mut done = record.clone();
        done.succeed(invocation.appends.iter().filter_map(|a| a.id).collect());
        let log = log_append(&done).map_err(|e| storage_failure(&e, attempt))?;

        let mut appends = invocation.appends;
        appends.push(log);
        let outcome = self
            .store
            .commit(WriteBatch { appends, state })
            .map_err(|e| storage_failure(&e, attempt))?;

        let mut committed = outcome.appended;
        for c in &committed {
            if c.deduplicated {
                continue;
            }
            if let Err(e) = self.notifier.notify(&c.entry.relation, c.entry.sequence) {
                tracing::warn!(relation = %c.entry.relation, error = %e, "cursor wake-up failed");
            }
        }
        // The last committed entry is the log row.
        committed.pop();
        Ok(committed.into_iter().map(|c| c.entry).collect())
    }
}
