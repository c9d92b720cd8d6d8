//! End-to-end cascade behaviour: propagation, fan-out, retries, failure
//! isolation and cancellation.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{
    counts_relation, fast_config, memory_store, raw_relation, started, word_count, word_count_catalog,
    FlakyStore, WAIT,
};
use tributary::{
    fields, CascadeState, CatalogBuilder, EntryStore, ExecutionError, ExecutionStatus, FailureKind, FieldType,
    PipelineConfig, Relation, RegistrationError, Schema, TributaryError, Trigger, TriggerError,
    TriggerInput, TriggerOutput, Value,
};

#[test]
fn word_count_produces_one_linked_entry() {
    let store = memory_store();
    let pipeline = started(word_count_catalog(), store.clone(), fast_config());
    let conn = pipeline.connect();

    let raw = conn.write("raw", fields([("text", "a b c")])).unwrap();
    let report = conn.wait_for_cascade(raw.id, WAIT).unwrap();

    assert_eq!(report.state, CascadeState::Resolved);
    assert_eq!(report.executions.len(), 1);
    let outputs: Vec<_> = report.outputs().collect();
    assert_eq!(outputs.len(), 1);

    let count = conn.get(outputs[0]).unwrap();
    assert_eq!(count.relation, "counts");
    assert_eq!(count.get("n"), Some(&Value::from(3)));
    assert_eq!(count.caused_by, Some(raw.id));
    assert_eq!(count.root, raw.id);

    let all: Vec<_> = conn.snapshot("counts").unwrap().map(Result::unwrap).collect();
    assert_eq!(all.len(), 1);
}

#[test]
fn fan_out_follows_registration_order() {
    let mut builder = CatalogBuilder::new();
    builder
        .relation(raw_relation())
        .unwrap()
        .relation(counts_relation())
        .unwrap()
        .relation(Relation::new("lengths", Schema::new().field("n", FieldType::Int)))
        .unwrap()
        .trigger(
            Trigger::on("zeta", "raw", |input: &TriggerInput<'_>| {
                let len = input.entry.get("text").and_then(Value::as_string).map_or(0, str::len);
                Ok(TriggerOutput::none().emit("lengths", fields([("n", len as i64)])))
            })
            .writes_to("lengths"),
        )
        .unwrap()
        .trigger(word_count())
        .unwrap();
    let pipeline = started(builder.build().unwrap(), memory_store(), fast_config());
    let conn = pipeline.connect();

    let raw = conn.write("raw", fields([("text", "hello world")])).unwrap();
    let report = conn.wait_for_cascade(raw.id, WAIT).unwrap();

    let order: Vec<_> = report.executions.iter().map(|r| r.key.trigger.as_str()).collect();
    assert_eq!(order, vec!["zeta", "word_count"]);
    assert!(report
        .executions
        .iter()
        .all(|r| r.status == ExecutionStatus::Succeeded));
    assert_eq!(report.outputs().count(), 2);
}

#[test]
fn deep_cascade_resolves_only_when_every_branch_is_done() {
    let mut builder = CatalogBuilder::new();
    builder
        .relation(raw_relation())
        .unwrap()
        .relation(counts_relation())
        .unwrap()
        .relation(Relation::new("doubled", Schema::new().field("n", FieldType::Int)))
        .unwrap()
        .trigger(word_count())
        .unwrap()
        .trigger(
            Trigger::on("doubler", "counts", |input: &TriggerInput<'_>| {
                std::thread::sleep(Duration::from_millis(50));
                let n = input.entry.get("n").and_then(Value::as_int).unwrap_or(0);
                Ok(TriggerOutput::none().emit("doubled", fields([("n", n * 2)])))
            })
            .writes_to("doubled"),
        )
        .unwrap();
    let pipeline = started(builder.build().unwrap(), memory_store(), fast_config());
    let conn = pipeline.connect();

    let raw = conn.write("raw", fields([("text", "one two")])).unwrap();
    let report = conn.wait_for_cascade(raw.id, WAIT).unwrap();

    assert_eq!(report.state, CascadeState::Resolved);
    let doubler = report.execution("doubler").unwrap();
    assert_eq!(doubler.status, ExecutionStatus::Succeeded);
    let doubled = conn.get(doubler.outputs[0]).unwrap();
    assert_eq!(doubled.get("n"), Some(&Value::from(4)));
    assert_eq!(doubled.root, raw.id);
    assert_ne!(doubled.caused_by, Some(raw.id));
}

#[test]
fn retryable_failure_stops_after_max_attempts() {
    let calls = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&calls);

    let mut builder = CatalogBuilder::new();
    builder
        .relation(raw_relation())
        .unwrap()
        .relation(counts_relation())
        .unwrap()
        .trigger(
            Trigger::on("flaky", "raw", move |_: &TriggerInput<'_>| {
                seen.fetch_add(1, Ordering::SeqCst);
                Err(TriggerError::retryable("downstream busy"))
            })
            .writes_to("counts")
            .max_attempts(3),
        )
        .unwrap();
    let store = memory_store();
    let pipeline = started(builder.build().unwrap(), store.clone(), fast_config());
    let conn = pipeline.connect();

    let raw = conn.write("raw", fields([("text", "x")])).unwrap();
    let report = conn.wait_for_cascade(raw.id, WAIT).unwrap();

    assert_eq!(report.state, CascadeState::ResolvedWithFailures);
    let record = report.execution("flaky").unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record.is_terminal());
    assert_eq!(record.attempts, 3);
    assert_eq!(record.times_entered(ExecutionStatus::Running), 3);
    assert_eq!(record.times_entered(ExecutionStatus::Failed), 3);
    assert!(record.outputs.is_empty());
    assert_eq!(record.last_error.as_ref().unwrap().kind, FailureKind::Retryable);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(store.last_sequence("counts").unwrap(), 0);

    let failed = conn.failed_executions().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].key, record.key);
}

#[test]
fn fatal_failure_is_not_retried() {
    let calls = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&calls);

    let mut builder = CatalogBuilder::new();
    builder
        .relation(raw_relation())
        .unwrap()
        .relation(counts_relation())
        .unwrap()
        .trigger(
            // `n` must be an int.
            Trigger::on("bad_schema", "raw", move |_: &TriggerInput<'_>| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(TriggerOutput::none().emit("counts", fields([("n", "three")])))
            })
            .writes_to("counts")
            .max_attempts(5),
        )
        .unwrap();
    let store = memory_store();
    let pipeline = started(builder.build().unwrap(), store.clone(), fast_config());
    let conn = pipeline.connect();

    let raw = conn.write("raw", fields([("text", "x")])).unwrap();
    let report = conn.wait_for_cascade(raw.id, WAIT).unwrap();

    let record = report.execution("bad_schema").unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.attempts, 1);
    assert_eq!(record.last_error.as_ref().unwrap().kind, FailureKind::Fatal);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.last_sequence("counts").unwrap(), 0);
}

#[test]
fn undeclared_output_and_panic_are_fatal() {
    let mut builder = CatalogBuilder::new();
    builder
        .relation(raw_relation())
        .unwrap()
        .relation(counts_relation())
        .unwrap()
        .trigger(Trigger::on("sneaky", "raw", |_: &TriggerInput<'_>| {
            Ok(TriggerOutput::none().emit("counts", fields([("n", 1)])))
        }))
        .unwrap()
        .trigger(Trigger::on("explodes", "raw", |_: &TriggerInput<'_>| -> Result<TriggerOutput, TriggerError> {
            panic!("kaboom")
        }))
        .unwrap();
    let store = memory_store();
    let pipeline = started(builder.build().unwrap(), store.clone(), fast_config());
    let conn = pipeline.connect();

    let raw = conn.write("raw", fields([("text", "x")])).unwrap();
    let report = conn.wait_for_cascade(raw.id, WAIT).unwrap();

    for name in ["sneaky", "explodes"] {
        let record = report.execution(name).unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed, "{name}");
        assert_eq!(record.attempts, 1, "{name}");
        assert_eq!(record.last_error.as_ref().unwrap().kind, FailureKind::Fatal, "{name}");
    }
    assert!(report
        .execution("explodes")
        .unwrap()
        .last_error
        .as_ref()
        .unwrap()
        .message
        .contains("kaboom"));
    assert_eq!(store.last_sequence("counts").unwrap(), 0);
    assert_eq!(report.failures().count(), 2);
}

#[test]
fn failed_branch_does_not_block_sibling() {
    let mut builder = CatalogBuilder::new();
    builder
        .relation(raw_relation())
        .unwrap()
        .relation(counts_relation())
        .unwrap()
        .trigger(Trigger::on("broken", "raw", |_: &TriggerInput<'_>| {
            Err(TriggerError::fatal("cannot handle this"))
        }))
        .unwrap()
        .trigger(word_count())
        .unwrap();
    let pipeline = started(builder.build().unwrap(), memory_store(), fast_config());
    let conn = pipeline.connect();

    let raw = conn.write("raw", fields([("text", "still counted")])).unwrap();
    let report = conn.wait_for_cascade(raw.id, WAIT).unwrap();

    assert_eq!(report.state, CascadeState::ResolvedWithFailures);
    assert_eq!(report.execution("broken").unwrap().status, ExecutionStatus::Failed);
    let counted = report.execution("word_count").unwrap();
    assert_eq!(counted.status, ExecutionStatus::Succeeded);
    assert_eq!(
        conn.get(counted.outputs[0]).unwrap().get("n"),
        Some(&Value::from(2))
    );
}

#[test]
fn store_outage_is_retried_until_it_clears() {
    let store = Arc::new(FlakyStore::new(&["counts"], 2));
    let pipeline = started(word_count_catalog(), store.clone(), fast_config());
    let conn = pipeline.connect();

    let raw = conn.write("raw", fields([("text", "a b")])).unwrap();
    let report = conn.wait_for_cascade(raw.id, WAIT).unwrap();

    let record = report.execution("word_count").unwrap();
    assert_eq!(record.status, ExecutionStatus::Succeeded);
    assert_eq!(record.attempts, 3);
    assert_eq!(record.times_entered(ExecutionStatus::Failed), 2);
    assert_eq!(store.failures_left(), 0);
    assert_eq!(report.outputs().count(), 1);
}

#[test]
fn cycle_is_rejected_at_build_time() {
    let mut builder = CatalogBuilder::new();
    builder
        .relation(Relation::new("x", Schema::new().field("v", FieldType::Int)))
        .unwrap()
        .relation(Relation::new("y", Schema::new().field("v", FieldType::Int)))
        .unwrap()
        .trigger(Trigger::on("a", "x", |_: &TriggerInput<'_>| Ok(TriggerOutput::none())).writes_to("y"))
        .unwrap()
        .trigger(Trigger::on("b", "y", |_: &TriggerInput<'_>| Ok(TriggerOutput::none())).writes_to("x"))
        .unwrap();

    match builder.build() {
        Err(TributaryError::Registration(RegistrationError::CycleDetected { cycle })) => {
            assert!(cycle.contains(&"a".to_string()));
            assert!(cycle.contains(&"b".to_string()));
            assert_eq!(cycle.first(), cycle.last());
        }
        other => panic!("expected CycleDetected, got {other:?}"),
    }
}

#[test]
fn cancelled_cascade_discards_pending_work() {
    let (started_tx, started_rx) = crossbeam_channel::unbounded::<String>();
    let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);

    let mut builder = CatalogBuilder::new();
    builder
        .relation(raw_relation())
        .unwrap()
        .trigger(
            // Stateful on an unkeyed relation: every execution shares one lane.
            Trigger::on("serial", "raw", move |input: &TriggerInput<'_>| {
                let text = input.entry.get("text").and_then(Value::as_string).unwrap_or("");
                let _ = started_tx.send(text.to_string());
                let _ = gate_rx.recv_timeout(WAIT);
                Ok(TriggerOutput::none())
            })
            .stateful(),
        )
        .unwrap();
    let pipeline = started(builder.build().unwrap(), memory_store(), fast_config());
    let conn = pipeline.connect();

    let first = conn.write("raw", fields([("text", "first")])).unwrap();
    assert_eq!(started_rx.recv_timeout(WAIT).unwrap(), "first");

    let second = conn.write("raw", fields([("text", "second")])).unwrap();
    let status = conn.cascade_status(second.id).unwrap();
    assert_eq!(status.state, CascadeState::InProgress);
    assert_eq!(status.executions[0].status, ExecutionStatus::Pending);

    assert!(conn.cancel_cascade(second.id).unwrap());
    gate_tx.send(()).unwrap();

    let done = conn.wait_for_cascade(first.id, WAIT).unwrap();
    assert_eq!(done.state, CascadeState::Resolved);
    let cancelled = conn.wait_for_cascade(second.id, WAIT).unwrap();
    assert_eq!(cancelled.state, CascadeState::Cancelled);
    assert_eq!(cancelled.executions[0].status, ExecutionStatus::Cancelled);
    assert_eq!(cancelled.executions[0].attempts, 0);

    pipeline.wait_idle(WAIT).unwrap();
    assert!(started_rx.try_recv().is_err());
    assert!(!conn.cancel_cascade(second.id).unwrap());
}

#[test]
fn cancelled_cascade_does_not_retry_running_failure() {
    let calls = Arc::new(AtomicU32::new(0));
    let (started_tx, started_rx) = crossbeam_channel::unbounded::<u32>();
    let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);

    let mut builder = CatalogBuilder::new();
    let seen = Arc::clone(&calls);
    builder
        .relation(raw_relation())
        .unwrap()
        .trigger(Trigger::on("flaky", "raw", move |input: &TriggerInput<'_>| {
            seen.fetch_add(1, Ordering::SeqCst);
            let _ = started_tx.send(input.attempt);
            let _ = gate_rx.recv_timeout(WAIT);
            Err(TriggerError::retryable("upstream busy"))
        }))
        .unwrap();
    let pipeline = started(builder.build().unwrap(), memory_store(), fast_config());
    let conn = pipeline.connect();

    let raw = conn.write("raw", fields([("text", "x")])).unwrap();
    assert_eq!(started_rx.recv_timeout(WAIT).unwrap(), 1);
    assert!(conn.cancel_cascade(raw.id).unwrap());
    gate_tx.send(()).unwrap();

    let report = conn.wait_for_cascade(raw.id, WAIT).unwrap();
    assert_eq!(report.state, CascadeState::Cancelled);
    let record = report.execution("flaky").unwrap();
    assert_eq!(record.status, ExecutionStatus::Cancelled);
    assert_eq!(record.attempts, 1);
    assert!(!record.retry_pending);

    pipeline.wait_idle(WAIT).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(started_rx.try_recv().is_err());
    let logged = conn.execution("flaky", raw.id).unwrap().unwrap();
    assert_eq!(logged.status, ExecutionStatus::Cancelled);
}

#[test]
fn evicted_executions_are_read_from_the_log() {
    let mut builder = CatalogBuilder::new();
    builder
        .relation(raw_relation())
        .unwrap()
        .relation(counts_relation())
        .unwrap()
        .trigger(word_count())
        .unwrap()
        .trigger(Trigger::on(
            "reject_empty",
            "raw",
            |input: &TriggerInput<'_>| -> Result<TriggerOutput, TriggerError> {
                match input.entry.get("text").and_then(Value::as_string) {
                    Some("") => Err(TriggerError::fatal("empty text")),
                    _ => Ok(TriggerOutput::none()),
                }
            },
        ))
        .unwrap();
    let config = PipelineConfig {
        archive_capacity: 1,
        ..fast_config()
    };
    let pipeline = started(builder.build().unwrap(), memory_store(), config);
    let conn = pipeline.connect();

    let empty = conn.write("raw", fields([("text", "")])).unwrap();
    conn.wait_for_cascade(empty.id, WAIT).unwrap();
    let first = conn.write("raw", fields([("text", "a b")])).unwrap();
    let first_report = conn.wait_for_cascade(first.id, WAIT).unwrap();
    for text in ["c", "d e f"] {
        let raw = conn.write("raw", fields([("text", text)])).unwrap();
        conn.wait_for_cascade(raw.id, WAIT).unwrap();
    }

    let failed = conn.execution("reject_empty", empty.id).unwrap().unwrap();
    assert_eq!(failed.status, ExecutionStatus::Failed);
    assert_eq!(failed.last_error.unwrap().message, "empty text");

    let counted = conn.execution("word_count", first.id).unwrap().unwrap();
    assert_eq!(counted.status, ExecutionStatus::Succeeded);
    assert_eq!(counted.outputs, first_report.execution("word_count").unwrap().outputs);
    assert_eq!(conn.get(counted.outputs[0]).unwrap().get("n"), Some(&Value::from(2)));

    let failures = conn.failed_executions().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].key, failed.key);
}

#[test]
fn lagging_relation_only_holds_back_cascades_that_wrote_to_it() {
    let store = Arc::new(FlakyStore::new(&[], 0));
    let mut builder = CatalogBuilder::new();
    builder
        .relation(raw_relation())
        .unwrap()
        .relation(counts_relation())
        .unwrap()
        .relation(Relation::new("notes", Schema::new().field("text", FieldType::String)))
        .unwrap()
        .trigger(word_count())
        .unwrap()
        .trigger(Trigger::on("audit", "counts", |_: &TriggerInput<'_>| Ok(TriggerOutput::none())))
        .unwrap()
        .trigger(Trigger::on("echo", "notes", |_: &TriggerInput<'_>| Ok(TriggerOutput::none())))
        .unwrap();
    let pipeline = started(builder.build().unwrap(), store.clone(), fast_config());
    let conn = pipeline.connect();

    store.block_reads("counts", true);
    let raw = conn.write("raw", fields([("text", "a b")])).unwrap();
    let err = conn
        .wait_for_cascade(raw.id, Duration::from_millis(300))
        .unwrap_err();
    assert!(matches!(err, TributaryError::Execution(ExecutionError::Timeout { .. })));

    let note = conn.write("notes", fields([("text", "hello")])).unwrap();
    let report = conn.wait_for_cascade(note.id, WAIT).unwrap();
    assert_eq!(report.state, CascadeState::Resolved);

    store.block_reads("counts", false);
    let report = conn.wait_for_cascade(raw.id, WAIT).unwrap();
    assert_eq!(report.state, CascadeState::Resolved);
    assert_eq!(report.executions.len(), 2);
    assert_eq!(report.execution("audit").unwrap().status, ExecutionStatus::Succeeded);
}

#[test]
fn execution_lookup_by_trigger_and_entry() {
    let pipeline = started(word_count_catalog(), memory_store(), fast_config());
    let conn = pipeline.connect();

    let raw = conn.write("raw", fields([("text", "a")])).unwrap();
    conn.wait_for_cascade(raw.id, WAIT).unwrap();

    let record = conn.execution("word_count", raw.id).unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Succeeded);
    assert_eq!(record.sequence, raw.sequence);
    assert_eq!(record.trigger_version, 1);
    assert!(conn.execution("missing", raw.id).unwrap_err().is_registration());
}
