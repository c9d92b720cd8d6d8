//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use tributary::storage::{CommitOutcome, KeyFilter, StoredState, WriteBatch};
use tributary::{
    fields, Catalog, CatalogBuilder, Entry, EntryId, EntryStore, FieldType, InMemoryEntryStore,
    PartitionKey, Pipeline, PipelineConfig, Relation, RetryBackoff, Schema, Sequence,
    StorageError, Trigger, TriggerInput, TriggerOutput, Value,
};

pub const WAIT: Duration = Duration::from_secs(10);

/// Installs a `RUST_LOG`-driven subscriber once per test binary.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Config with instant retries, for tests that count attempts.
pub fn fast_config() -> PipelineConfig {
    PipelineConfig {
        retry_backoff: RetryBackoff::none(),
        tick_interval: Duration::from_millis(10),
        ..PipelineConfig::default()
    }
}

pub fn raw_relation() -> Relation {
    Relation::new("raw", Schema::new().field("text", FieldType::String))
}

pub fn counts_relation() -> Relation {
    Relation::new("counts", Schema::new().field("n", FieldType::Int))
}

/// `raw {text}` -> `word_count` -> `counts {n}`.
pub fn word_count() -> Trigger {
    Trigger::on("word_count", "raw", |input: &TriggerInput<'_>| {
        let text = input.entry.get("text").and_then(Value::as_string).unwrap_or("");
        let n = text.split_whitespace().count() as i64;
        Ok(TriggerOutput::none().emit("counts", fields([("n", n)])))
    })
    .writes_to("counts")
}

pub fn word_count_catalog() -> Arc<Catalog> {
    let mut builder = CatalogBuilder::new();
    builder
        .relation(raw_relation())
        .unwrap()
        .relation(counts_relation())
        .unwrap()
        .trigger(word_count())
        .unwrap();
    builder.build().unwrap()
}

pub fn started(catalog: Arc<Catalog>, store: Arc<dyn EntryStore>, config: PipelineConfig) -> Pipeline {
    init_tracing();
    let pipeline = Pipeline::new(catalog, store, config).unwrap();
    pipeline.start().unwrap();
    pipeline
}

pub fn memory_store() -> Arc<InMemoryEntryStore> {
    Arc::new(InMemoryEntryStore::new())
}

/// In-memory store whose commits into chosen relations fail with
/// `Unavailable` a set number of times, and whose reads of blocked
/// relations fail until unblocked.
pub struct FlakyStore {
    inner: InMemoryEntryStore,
    relations: HashSet<String>,
    failures_left: AtomicU32,
    blocked_reads: Mutex<HashSet<String>>,
}

impl FlakyStore {
    pub fn new(relations: &[&str], failures: u32) -> Self {
        Self {
            inner: InMemoryEntryStore::new(),
            relations: relations.iter().map(|r| (*r).to_string()).collect(),
            failures_left: AtomicU32::new(failures),
            blocked_reads: Mutex::new(HashSet::new()),
        }
    }

    /// Makes `read_after` on `relation` fail with `Unavailable` while `blocked`.
    pub fn block_reads(&self, relation: &str, blocked: bool) {
        let mut set = self.blocked_reads.lock().unwrap();
        if blocked {
            set.insert(relation.to_string());
        } else {
            set.remove(relation);
        }
    }

    pub fn failures_left(&self) -> u32 {
        self.failures_left.load(Ordering::SeqCst)
    }
}

impl EntryStore for FlakyStore {
    fn commit(&self, batch: WriteBatch) -> Result<CommitOutcome, StorageError> {
        let targeted = batch.appends.iter().any(|a| self.relations.contains(&a.relation));
        if targeted
            && self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(StorageError::Unavailable("injected outage".to_string()));
        }
        self.inner.commit(batch)
    }

    fn read_after(
        &self,
        relation: &str,
        after: Sequence,
        filter: Option<&KeyFilter>,
        limit: usize,
    ) -> Result<Vec<Entry>, StorageError> {
        if self.blocked_reads.lock().unwrap().contains(relation) {
            return Err(StorageError::Unavailable("injected read outage".to_string()));
        }
        self.inner.read_after(relation, after, filter, limit)
    }

    fn get(&self, id: EntryId) -> Result<Option<Entry>, StorageError> {
        self.inner.get(id)
    }

    fn latest(&self, relation: &str, key: &PartitionKey) -> Result<Option<Entry>, StorageError> {
        self.inner.latest(relation, key)
    }

    fn last_sequence(&self, relation: &str) -> Result<Sequence, StorageError> {
        self.inner.last_sequence(relation)
    }

    fn get_state(&self, trigger: &str, key: &PartitionKey) -> Result<Option<StoredState>, StorageError> {
        self.inner.get_state(trigger, key)
    }
}
