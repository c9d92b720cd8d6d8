//! Trigger definitions.
//!
//! A trigger is a named function bound to exactly one input relation and
//! zero or more declared output relations. Stateful triggers own private
//! state per partition key; the dispatcher guarantees that at most one
//! execution per (trigger, key) runs at a time, so trigger code never
//! needs locks.
//!
//! ```
//! use tributary::{fields, Trigger, TriggerOutput, Value};
//!
//! let word_count = Trigger::on("wordCount", "raw", |input| {
//!     let text = input.entry.get("text").and_then(Value::as_string).unwrap_or("");
//!     let n = text.split_whitespace().count();
//!     Ok(TriggerOutput::none().emit("counts", fields([("n", n)])))
//! })
//! .writes_to("counts");
//! assert_eq!(word_count.outputs(), ["counts"]);
//! ```

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::entry::{Entry, Fields, PartitionKey};
use crate::registry::Relation;

/// Prefix of the implicit input relation of a scheduled trigger.
pub const TICK_RELATION_PREFIX: &str = "__tick_";

/// Name of the tick relation feeding scheduled trigger `trigger`.
#[must_use]
pub fn tick_relation_name(trigger: &str) -> String {
    format!("{TICK_RELATION_PREFIX}{trigger}")
}

/// Failure reported by trigger code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TriggerError {
    /// Transient; the execution is retried with the same input.
    #[error("retryable: {message}")]
    Retryable { message: String },

    /// Permanent; the execution fails without further attempts.
    #[error("fatal: {message}")]
    Fatal { message: String },
}

impl TriggerError {
    /// Error that may succeed on a later attempt.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
        }
    }

    /// Error that no retry will fix.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// True for retryable errors.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }
}

/// What a trigger sees for one invocation.
#[derive(Debug, Clone, Copy)]
pub struct TriggerInput<'a> {
    /// Entry that fired the trigger.
    pub entry: &'a Entry,
    /// Partition key of this execution.
    pub key: &'a PartitionKey,
    /// State owned by this trigger for `key`, if any.
    pub state: Option<&'a serde_json::Value>,
    /// 1 on the first attempt.
    pub attempt: u32,
}

/// Change to a trigger's per-key state.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum StateUpdate {
    /// Leave the state as it is.
    #[default]
    Keep,
    /// Replace the state.
    Set(serde_json::Value),
    /// Delete the state.
    Clear,
}

/// Result of a successful invocation: entries to emit and a state change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriggerOutput {
    /// Entries to append as `(relation, fields)`.
    pub emits: Vec<(String, Fields)>,
    /// State change for stateful triggers.
    pub state: StateUpdate,
}

impl TriggerOutput {
    /// No outputs, state unchanged.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Queues an output entry for `relation`.
    #[must_use]
    pub fn emit(mut self, relation: impl Into<String>, fields: Fields) -> Self {
        self.emits.push((relation.into(), fields));
        self
    }

    /// Replaces the trigger's state.
    #[must_use]
    pub fn with_state(mut self, state: serde_json::Value) -> Self {
        self.state = StateUpdate::Set(state);
        self
    }

    /// Deletes the trigger's state.
    #[must_use]
    pub fn clear_state(mut self) -> Self {
        self.state = StateUpdate::Clear;
        self
    }
}

/// The function body of a trigger.
///
/// Implemented for every `Fn(&TriggerInput) -> Result<TriggerOutput, TriggerError>`
/// closure. Implementations must not touch shared memory outside the
/// state and outputs they return.
pub trait TriggerFn: Send + Sync {
    /// Runs the trigger on one input.
    fn call(&self, input: &TriggerInput<'_>) -> Result<TriggerOutput, TriggerError>;
}

impl<F> TriggerFn for F
where
    F: Fn(&TriggerInput<'_>) -> Result<TriggerOutput, TriggerError> + Send + Sync,
{
    fn call(&self, input: &TriggerInput<'_>) -> Result<TriggerOutput, TriggerError> {
        self(input)
    }
}

/// Whether a trigger owns per-key state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// No state; executions run fully in parallel.
    #[default]
    Stateless,
    /// Exclusive state per partition key.
    ///
    /// `partition_by` names an input field; when absent the input
    /// relation's key field is used, and failing that a single global key.
    Stateful { partition_by: Option<String> },
}

/// What makes a trigger eligible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerSource {
    /// Fires once per entry appended to the named relation.
    Relation(String),
    /// Cron expression; fires through an implicit tick relation.
    Schedule(String),
}

/// A registered trigger.
#[derive(Clone)]
pub struct Trigger {
    name: String,
    source: TriggerSource,
    input: String,
    outputs: Vec<String>,
    mode: ExecutionMode,
    max_attempts: Option<u32>,
    version: u32,
    handler: Arc<dyn TriggerFn>,
}

impl Trigger {
    /// A trigger fired by entries appended to `relation`.
    pub fn on<F>(name: impl Into<String>, relation: impl Into<String>, f: F) -> Self
    where
        F: Fn(&TriggerInput<'_>) -> Result<TriggerOutput, TriggerError> + Send + Sync + 'static,
    {
        Self::with_handler(name, TriggerSource::Relation(relation.into()), Arc::new(f))
    }

    /// A trigger fired on a cron schedule.
    pub fn scheduled<F>(name: impl Into<String>, cron: impl Into<String>, f: F) -> Self
    where
        F: Fn(&TriggerInput<'_>) -> Result<TriggerOutput, TriggerError> + Send + Sync + 'static,
    {
        Self::with_handler(name, TriggerSource::Schedule(cron.into()), Arc::new(f))
    }

    /// A trigger backed by a shared handler object.
    pub fn with_handler(
        name: impl Into<String>,
        source: TriggerSource,
        handler: Arc<dyn TriggerFn>,
    ) -> Self {
        let name = name.into();
        let input = match &source {
            TriggerSource::Relation(r) => r.clone(),
            TriggerSource::Schedule(_) => tick_relation_name(&name),
        };
        Self {
            name,
            source,
            input,
            outputs: Vec::new(),
            mode: ExecutionMode::Stateless,
            max_attempts: None,
            version: 1,
            handler,
        }
    }

    /// Declares an output relation.
    #[must_use]
    pub fn writes_to(mut self, relation: impl Into<String>) -> Self {
        let relation = relation.into();
        if !self.outputs.contains(&relation) {
            self.outputs.push(relation);
        }
        self
    }

    /// Makes the trigger stateful, partitioned by the input relation's key.
    #[must_use]
    pub fn stateful(mut self) -> Self {
        self.mode = ExecutionMode::Stateful { partition_by: None };
        self
    }

    /// Makes the trigger stateful, partitioned by `field` of the input entry.
    #[must_use]
    pub fn partition_by(mut self, field: impl Into<String>) -> Self {
        self.mode = ExecutionMode::Stateful {
            partition_by: Some(field.into()),
        };
        self
    }

    /// Overrides the pipeline's default attempt limit.
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Version recorded on every execution of this trigger.
    #[must_use]
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Unique trigger name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Relation or schedule the trigger fires on.
    #[must_use]
    pub fn source(&self) -> &TriggerSource {
        &self.source
    }

    /// Input relation; the tick relation for scheduled triggers.
    #[must_use]
    pub fn input(&self) -> &str {
        &self.input
    }

    /// Relations the trigger may write.
    #[must_use]
    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    /// True if `relation` is a declared output.
    #[must_use]
    pub fn writes(&self, relation: &str) -> bool {
        self.outputs.iter().any(|r| r == relation)
    }

    /// Stateless or stateful execution.
    #[must_use]
    pub fn mode(&self) -> &ExecutionMode {
        &self.mode
    }

    /// True for stateful triggers.
    #[must_use]
    pub fn is_stateful(&self) -> bool {
        matches!(self.mode, ExecutionMode::Stateful { .. })
    }

    /// Cron expression of a scheduled trigger.
    #[must_use]
    pub fn schedule(&self) -> Option<&str> {
        match &self.source {
            TriggerSource::Schedule(expr) => Some(expr),
            TriggerSource::Relation(_) => None,
        }
    }

    /// Attempt limit overriding the pipeline default.
    #[must_use]
    pub fn attempt_limit(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Version recorded on each execution.
    #[must_use]
    pub fn trigger_version(&self) -> u32 {
        self.version
    }

    pub(crate) fn handler(&self) -> &dyn TriggerFn {
        self.handler.as_ref()
    }

    /// Partition key of an execution of this trigger for `entry`.
    ///
    /// Stateless executions are keyed by entry id and never contend.
    #[must_use]
    pub fn partition_key(&self, entry: &Entry, input: &Relation) -> PartitionKey {
        match &self.mode {
            ExecutionMode::Stateless => PartitionKey::new(entry.id.to_string()),
            ExecutionMode::Stateful {
                partition_by: Some(field),
            } => entry.partition_key(field).unwrap_or_else(PartitionKey::global),
            ExecutionMode::Stateful { partition_by: None } => {
                input.key_of(entry).unwrap_or_else(PartitionKey::global)
            }
        }
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trigger")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("outputs", &self.outputs)
            .field("mode", &self.mode)
            .field("max_attempts", &self.max_attempts)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{fields, EntryId};
    use crate::schema::Schema;
    use crate::value::{FieldType, Value};
    use chrono::Utc;

    fn entry(user: &str) -> Entry {
        let id = EntryId::new();
        Entry {
            id,
            relation: "events".into(),
            sequence: 1,
            fields: fields([("user", Value::from(user)), ("region", Value::from("eu"))]),
            caused_by: None,
            root: id,
            written_at: Utc::now(),
        }
    }

    fn events() -> Relation {
        Relation::new(
            "events",
            Schema::new()
                .field("user", FieldType::String)
                .field("region", FieldType::String),
        )
        .keyed_by("user")
    }

    fn noop(_: &TriggerInput<'_>) -> Result<TriggerOutput, TriggerError> {
        Ok(TriggerOutput::none())
    }

    #[test]
    fn test_partition_key_resolution() {
        let e = entry("u1");
        let stateless = Trigger::on("a", "events", noop);
        assert_eq!(stateless.partition_key(&e, &events()).as_str(), e.id.to_string());

        let by_relation_key = Trigger::on("b", "events", noop).stateful();
        assert_eq!(by_relation_key.partition_key(&e, &events()).as_str(), "u1");

        let by_field = Trigger::on("c", "events", noop).partition_by("region");
        assert_eq!(by_field.partition_key(&e, &events()).as_str(), "eu");

        let unkeyed = Relation::new("events", Schema::new().field("user", FieldType::String));
        assert_eq!(
            by_relation_key.partition_key(&e, &unkeyed),
            PartitionKey::global()
        );
    }

    #[test]
    fn test_scheduled_trigger_reads_tick_relation() {
        let t = Trigger::scheduled("hourly", "0 0 * * * *", noop);
        assert_eq!(t.input(), "__tick_hourly");
        assert_eq!(t.schedule(), Some("0 0 * * * *"));
        assert!(!t.is_stateful());
    }

    #[test]
    fn test_writes_to_deduplicates() {
        let t = Trigger::on("a", "raw", noop)
            .writes_to("counts")
            .writes_to("counts")
            .writes_to("audit");
        assert_eq!(t.outputs(), ["counts", "audit"]);
        assert!(t.writes("audit"));
        assert!(!t.writes("raw"));
    }

    #[test]
    fn test_closure_handler_is_called() {
        let t = Trigger::on("double", "raw", |input| {
            let n = input.entry.get("n").and_then(Value::as_int).unwrap_or(0);
            Ok(TriggerOutput::none()
                .emit("out", fields([("n", n * 2)]))
                .with_state(serde_json::json!(n)))
        });
        let id = EntryId::new();
        let e = Entry {
            id,
            relation: "raw".into(),
            sequence: 1,
            fields: fields([("n", 21)]),
            caused_by: None,
            root: id,
            written_at: Utc::now(),
        };
        let key = PartitionKey::global();
        let out = t
            .handler()
            .call(&TriggerInput {
                entry: &e,
                key: &key,
                state: None,
                attempt: 1,
            })
            .unwrap();
        assert_eq!(out.emits[0].1["n"], Value::Int(42));
        assert_eq!(out.state, StateUpdate::Set(serde_json::json!(21)));
    }

    #[test]
    fn test_trigger_error_kinds() {
        assert!(TriggerError::retryable("db busy").is_retryable());
        assert!(!TriggerError::fatal("bad input").is_retryable());
        assert_eq!(TriggerError::fatal("x").to_string(), "fatal: x");
    }
}
