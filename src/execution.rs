//! Execution records.
//!
//! One record exists per (trigger, input entry) pair. The dispatcher owns
//! every record and drives it through
//! `Pending -> Running -> {Succeeded | Failed}`, with `Failed -> Pending`
//! while attempts remain. Callers only ever see snapshots.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entry::{fields, AppendRequest, Entry, EntryId, PartitionKey, Sequence};
use crate::registry::Relation;
use crate::schema::Schema;
use crate::storage::StorageError;
use crate::value::{FieldType, Value};

/// Internal relation holding one row per execution that reached a terminal
/// status. A later row for the same execution supersedes an earlier one.
pub const EXECUTION_LOG: &str = "__executions";

/// Identifies one execution: a trigger applied to one input entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionKey {
    /// Trigger name.
    pub trigger: String,
    /// Input entry.
    pub entry: EntryId,
}

impl ExecutionKey {
    /// Key of `trigger` applied to `entry`.
    #[must_use]
    pub fn new(trigger: impl Into<String>, entry: EntryId) -> Self {
        Self {
            trigger: trigger.into(),
            entry,
        }
    }
}

impl ExecutionKey {
    /// Key of this execution's rows in the execution log.
    #[must_use]
    pub fn log_key(&self) -> PartitionKey {
        PartitionKey::new(format!("{}:{}", self.trigger, self.entry))
    }
}

impl fmt::Display for ExecutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.trigger, self.entry)
    }
}

/// Lifecycle state of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Waiting for a worker, its lane or a retry.
    Pending,
    /// An attempt is on a worker.
    Running,
    /// Outputs and state committed.
    Succeeded,
    /// Last attempt failed; terminal unless `retry_pending`.
    Failed,
    /// Dropped without another attempt because the cascade was cancelled
    /// or the pipeline stopped.
    Cancelled,
}

impl ExecutionStatus {
    /// Lowercase name, as written to the execution log.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a failed attempt is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient; consumes an attempt and is retried while attempts remain.
    Retryable,
    /// Terminal immediately.
    Fatal,
}

/// Why an attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    /// Retryable or fatal.
    pub kind: FailureKind,
    /// Error text from the trigger or the store.
    pub message: String,
    /// Attempt that failed, starting at 1.
    pub attempt: u32,
}

impl ExecutionFailure {
    /// Failure that may be retried.
    pub fn retryable(message: impl Into<String>, attempt: u32) -> Self {
        Self {
            kind: FailureKind::Retryable,
            message: message.into(),
            attempt,
        }
    }

    /// Failure that ends the execution.
    pub fn fatal(message: impl Into<String>, attempt: u32) -> Self {
        Self {
            kind: FailureKind::Fatal,
            message: message.into(),
            attempt,
        }
    }
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            FailureKind::Retryable => "retryable",
            FailureKind::Fatal => "fatal",
        };
        write!(f, "{kind} failure on attempt {}: {}", self.attempt, self.message)
    }
}

/// One status transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    /// State entered.
    pub status: ExecutionStatus,
    /// Attempt number at the time.
    pub attempt: u32,
    /// When the transition happened.
    pub at: DateTime<Utc>,
}

/// Bookkeeping for one (trigger, entry) execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Trigger and input entry.
    pub key: ExecutionKey,
    /// Version of the trigger definition that ran.
    pub trigger_version: u32,
    /// Relation of the input entry.
    pub relation: String,
    /// Sequence of the input entry.
    pub sequence: Sequence,
    /// Root entry of the cascade this execution belongs to.
    pub root: EntryId,
    /// Lane the execution ran in.
    pub partition: PartitionKey,
    /// Current state.
    pub status: ExecutionStatus,
    /// Attempts started so far.
    pub attempts: u32,
    /// Attempt limit for this execution.
    pub max_attempts: u32,
    /// Entries produced; empty until succeeded.
    pub outputs: Vec<EntryId>,
    /// Most recent failure.
    pub last_error: Option<ExecutionFailure>,
    /// True while a failed execution waits for its next attempt.
    pub retry_pending: bool,
    /// Every transition, oldest first.
    pub history: Vec<StatusChange>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record became terminal.
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        key: ExecutionKey,
        trigger_version: u32,
        relation: String,
        sequence: Sequence,
        root: EntryId,
        partition: PartitionKey,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            key,
            trigger_version,
            relation,
            sequence,
            root,
            partition,
            status: ExecutionStatus::Pending,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            outputs: Vec::new(),
            last_error: None,
            retry_pending: false,
            history: vec![StatusChange {
                status: ExecutionStatus::Pending,
                attempt: 0,
                at: now,
            }],
            created_at: now,
            finished_at: None,
        }
    }

    fn record(&mut self, status: ExecutionStatus) {
        self.status = status;
        self.history.push(StatusChange {
            status,
            attempt: self.attempts,
            at: Utc::now(),
        });
    }

    /// `Pending -> Running`; returns the attempt number.
    pub(crate) fn start(&mut self) -> Option<u32> {
        if self.status != ExecutionStatus::Pending {
            return None;
        }
        self.attempts += 1;
        self.record(ExecutionStatus::Running);
        Some(self.attempts)
    }

    /// `Running -> Succeeded`.
    pub(crate) fn succeed(&mut self, outputs: Vec<EntryId>) -> bool {
        if self.status != ExecutionStatus::Running {
            return false;
        }
        self.outputs = outputs;
        self.finished_at = Some(Utc::now());
        self.record(ExecutionStatus::Succeeded);
        true
    }

    /// `Running -> Failed`. Returns true if another attempt should follow.
    pub(crate) fn fail(&mut self, failure: ExecutionFailure) -> bool {
        if self.status != ExecutionStatus::Running {
            return false;
        }
        let retry = failure.kind == FailureKind::Retryable && self.attempts < self.max_attempts;
        self.last_error = Some(failure);
        self.retry_pending = retry;
        if !retry {
            self.finished_at = Some(Utc::now());
        }
        self.record(ExecutionStatus::Failed);
        retry
    }

    /// `Failed -> Pending` for the next attempt.
    pub(crate) fn retry(&mut self) -> bool {
        if self.status != ExecutionStatus::Failed || !self.retry_pending {
            return false;
        }
        self.retry_pending = false;
        self.record(ExecutionStatus::Pending);
        true
    }

    /// Discards a record that is not running.
    pub(crate) fn cancel(&mut self) -> bool {
        let cancellable = self.status == ExecutionStatus::Pending
            || (self.status == ExecutionStatus::Failed && self.retry_pending);
        if !cancellable {
            return false;
        }
        self.retry_pending = false;
        self.finished_at = Some(Utc::now());
        self.record(ExecutionStatus::Cancelled);
        true
    }

    /// No further transition will happen.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self.status {
            ExecutionStatus::Succeeded | ExecutionStatus::Cancelled => true,
            ExecutionStatus::Failed => !self.retry_pending,
            ExecutionStatus::Pending | ExecutionStatus::Running => false,
        }
    }

    /// Number of times the record entered `status`.
    #[must_use]
    pub fn times_entered(&self, status: ExecutionStatus) -> usize {
        self.history.iter().filter(|c| c.status == status).count()
    }
}

/// Resolution state of a cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeState {
    /// Some execution is not terminal yet.
    InProgress,
    /// Every execution succeeded.
    Resolved,
    /// All executions are terminal and at least one failed.
    ResolvedWithFailures,
    /// Cancelled before resolving.
    Cancelled,
}

impl CascadeState {
    /// True unless the cascade is still in progress.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// Status of every execution in the cascade rooted at `root`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeReport {
    /// Externally written entry the cascade started from.
    pub root: EntryId,
    /// Derived state.
    pub state: CascadeState,
    /// Executions in creation order.
    pub executions: Vec<ExecutionRecord>,
}

impl CascadeReport {
    /// Derives the state from the records.
    pub(crate) fn from_records(root: EntryId, cancelled: bool, executions: Vec<ExecutionRecord>) -> Self {
        let state = if executions.iter().any(|r| !r.is_terminal()) {
            CascadeState::InProgress
        } else if cancelled {
            CascadeState::Cancelled
        } else if executions
            .iter()
            .any(|r| r.status == ExecutionStatus::Failed)
        {
            CascadeState::ResolvedWithFailures
        } else {
            CascadeState::Resolved
        };
        Self {
            root,
            state,
            executions,
        }
    }

    /// Executions that ended `Failed`.
    pub fn failures(&self) -> impl Iterator<Item = &ExecutionRecord> {
        self.executions
            .iter()
            .filter(|r| r.status == ExecutionStatus::Failed && !r.retry_pending)
    }

    /// Every entry produced anywhere in the cascade.
    pub fn outputs(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.executions.iter().flat_map(|r| r.outputs.iter().copied())
    }

    /// Record for `trigger`, if it ran in this cascade.
    #[must_use]
    pub fn execution(&self, trigger: &str) -> Option<&ExecutionRecord> {
        self.executions.iter().find(|r| r.key.trigger == trigger)
    }
}

pub(crate) fn log_relation() -> Relation {
    Relation::new(
        EXECUTION_LOG,
        Schema::new()
            .field("execution", FieldType::String)
            .field("trigger", FieldType::String)
            .field("status", FieldType::String)
            .field("record", FieldType::String),
    )
    .keyed_by("execution")
}

/// Log row for a terminal record.
pub(crate) fn log_append(record: &ExecutionRecord) -> Result<AppendRequest, StorageError> {
    let json = serde_json::to_string(record).map_err(|e| StorageError::SerializationError(e.to_string()))?;
    let key = record.key.log_key();
    let row = fields([
        ("execution", Value::from(key.as_str())),
        ("trigger", Value::from(record.key.trigger.as_str())),
        ("status", Value::from(record.status.name())),
        ("record", Value::from(json)),
    ]);
    Ok(AppendRequest::new(EXECUTION_LOG, row).latest_key(Some(key)))
}

/// Decodes a log row written by [`log_append`].
pub(crate) fn from_log(entry: &Entry) -> Option<ExecutionRecord> {
    let json = entry.get("record").and_then(Value::as_string)?;
    serde_json::from_str(json).ok()
}
