//! # tributary - trigger pipelines over append-only relations
//!
//! Applications declare typed relations and triggers. A trigger runs when an
//! entry is appended to its input relation (or when its cron schedule
//! fires) and may emit entries into other relations, which fire their own
//! triggers in turn. The engine guarantees:
//!
//! - the trigger graph is acyclic, checked once when the catalog is built
//! - per (stateful trigger, partition key), executions run one at a time in
//!   entry sequence order
//! - a trigger's outputs and state change commit atomically
//! - retryable failures are retried with backoff up to an attempt limit;
//!   fatal failures stop immediately and are always reported
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tributary::storage::InMemoryEntryStore;
//! use tributary::{
//!     fields, Catalog, FieldType, Pipeline, PipelineConfig, Relation, Schema, Trigger,
//!     TriggerInput, TriggerOutput, Value,
//! };
//!
//! let mut builder = Catalog::builder();
//! builder
//!     .relation(Relation::new("raw", Schema::new().field("text", FieldType::String)))?
//!     .relation(Relation::new("counts", Schema::new().field("n", FieldType::Int)))?
//!     .trigger(
//!         Trigger::on("word_count", "raw", |input: &TriggerInput<'_>| {
//!             let text = input.entry.get("text").and_then(Value::as_string).unwrap_or("");
//!             let n = text.split_whitespace().count() as i64;
//!             Ok(TriggerOutput::none().emit("counts", fields([("n", n)])))
//!         })
//!         .writes_to("counts"),
//!     )?;
//!
//! let pipeline = Pipeline::new(builder.build()?, Arc::new(InMemoryEntryStore::new()), PipelineConfig::default())?;
//! pipeline.start()?;
//!
//! let conn = pipeline.connect();
//! let raw = conn.write("raw", fields([("text", "a b c")]))?;
//! let report = conn.wait_for_cascade(raw.id, Duration::from_secs(5))?;
//!
//! let count = conn.get(report.outputs().next().unwrap())?;
//! assert_eq!(count.get("n"), Some(&Value::from(3)));
//! assert_eq!(count.caused_by, Some(raw.id));
//! # Ok::<(), tributary::TributaryError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Data model
pub mod entry;
pub mod error;
pub mod schema;
pub mod value;

// Definition
pub mod catalog;
pub mod graph;
pub mod registry;
pub mod trigger;

// Runtime
mod clock;
pub mod connection;
pub mod cursor;
mod dispatcher;
pub mod execution;
pub mod executor;
pub mod pipeline;
pub mod storage;

pub use catalog::{Catalog, CatalogBuilder};
pub use connection::Connection;
pub use cursor::{Cursor, CursorOptions, ReadMode};
pub use entry::{fields, AppendRequest, Entry, EntryId, Fields, PartitionKey, Provenance, Sequence};
pub use error::{
    ExecutionError, RegistrationError, TributaryError, TributaryResult, ValidationError,
};
pub use execution::{
    CascadeReport, CascadeState, ExecutionFailure, ExecutionKey, ExecutionRecord, ExecutionStatus,
    FailureKind,
};
pub use graph::TriggerGraph;
pub use pipeline::{Pipeline, PipelineConfig, RetryBackoff, StartPosition};
pub use registry::{Relation, RelationRegistry};
pub use schema::{Field, Schema};
pub use storage::{EntryStore, InMemoryEntryStore, StorageError};
pub use trigger::{
    ExecutionMode, StateUpdate, Trigger, TriggerError, TriggerFn, TriggerInput, TriggerOutput,
    TriggerSource,
};
pub use value::{FieldType, Value};
