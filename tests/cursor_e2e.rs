//! Cursors opened through a connection.

mod common;

use std::thread;
use std::time::{Duration, Instant};

use common::{fast_config, memory_store, started, word_count_catalog, WAIT};
use tributary::{
    fields, CatalogBuilder, CursorOptions, ExecutionError, FieldType, ReadMode, Relation, Schema,
    TributaryError, Value,
};

#[test]
fn snapshot_sees_exactly_what_existed_at_open() {
    let pipeline = started(word_count_catalog(), memory_store(), fast_config());
    let conn = pipeline.connect();
    for text in ["a", "b", "c"] {
        conn.write("raw", fields([("text", text)])).unwrap();
    }

    let mut cursor = conn.cursor("raw", CursorOptions::snapshot().batch_size(2)).unwrap();
    assert_eq!(cursor.mode(), ReadMode::Snapshot);
    assert_eq!(cursor.upper_bound(), Some(3));

    conn.write("raw", fields([("text", "late")])).unwrap();

    let mut texts = Vec::new();
    while let Some(entry) = cursor.next_entry().unwrap() {
        texts.push(entry.get("text").and_then(Value::as_string).unwrap().to_string());
    }
    assert_eq!(texts, ["a", "b", "c"]);
    assert_eq!(cursor.position(), 3);
    assert!(cursor.next_entry().unwrap().is_none());
}

#[test]
fn snapshot_can_resume_after_a_position() {
    let pipeline = started(word_count_catalog(), memory_store(), fast_config());
    let conn = pipeline.connect();
    for text in ["a", "b", "c", "d"] {
        conn.write("raw", fields([("text", text)])).unwrap();
    }

    let seqs: Vec<_> = conn
        .cursor("raw", CursorOptions::snapshot().after(2))
        .unwrap()
        .map(|e| e.unwrap().sequence)
        .collect();
    assert_eq!(seqs, [3, 4]);
}

#[test]
fn live_cursor_follows_later_writes() {
    let pipeline = started(word_count_catalog(), memory_store(), fast_config());
    let conn = pipeline.connect();
    conn.write("raw", fields([("text", "before")])).unwrap();

    let mut cursor = conn
        .cursor("raw", CursorOptions::live().wait_timeout(WAIT))
        .unwrap();
    assert_eq!(cursor.next_entry().unwrap().unwrap().sequence, 1);

    let writer = conn.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        writer.write("raw", fields([("text", "after")])).unwrap()
    });

    let next = cursor.next_entry().unwrap().unwrap();
    let written = handle.join().unwrap();
    assert_eq!(next.id, written.id);
    assert_eq!(next.sequence, 2);
}

#[test]
fn live_cursor_times_out_quietly() {
    let pipeline = started(word_count_catalog(), memory_store(), fast_config());
    let conn = pipeline.connect();

    let mut cursor = conn
        .cursor("counts", CursorOptions::live().wait_timeout(Duration::from_millis(50)))
        .unwrap();
    let started_at = Instant::now();
    assert!(cursor.next_entry().unwrap().is_none());
    assert!(started_at.elapsed() >= Duration::from_millis(50));

    let raw = conn.write("raw", fields([("text", "x y")])).unwrap();
    conn.wait_for_cascade(raw.id, WAIT).unwrap();
    let count = cursor.next_entry().unwrap().unwrap();
    assert_eq!(count.get("n"), Some(&Value::from(2)));
}

#[test]
fn partition_filter_reads_one_key() {
    let mut builder = CatalogBuilder::new();
    builder
        .relation(
            Relation::new(
                "visits",
                Schema::new()
                    .field("user", FieldType::String)
                    .field("page", FieldType::String),
            )
            .keyed_by("user"),
        )
        .unwrap()
        .relation(Relation::new("notes", Schema::new().field("text", FieldType::String)))
        .unwrap();
    let pipeline = started(builder.build().unwrap(), memory_store(), fast_config());
    let conn = pipeline.connect();

    for (user, page) in [("ana", "/"), ("ben", "/a"), ("ana", "/b"), ("cy", "/"), ("ana", "/c")] {
        conn.write("visits", fields([("user", user), ("page", page)])).unwrap();
    }

    let pages: Vec<_> = conn
        .cursor("visits", CursorOptions::snapshot().partition("ana"))
        .unwrap()
        .map(|e| e.unwrap().get("page").and_then(Value::as_string).unwrap().to_string())
        .collect();
    assert_eq!(pages, ["/", "/b", "/c"]);

    let err = conn
        .cursor("notes", CursorOptions::snapshot().partition("ana"))
        .unwrap_err();
    assert!(err.is_validation());
}

#[test]
fn cursor_requires_running_pipeline() {
    let pipeline = started(word_count_catalog(), memory_store(), fast_config());
    let conn = pipeline.connect();
    pipeline.stop().unwrap();

    let err = conn.snapshot("raw").unwrap_err();
    assert!(matches!(
        err,
        TributaryError::Execution(ExecutionError::NotStarted | ExecutionError::ShuttingDown)
    ));
}
