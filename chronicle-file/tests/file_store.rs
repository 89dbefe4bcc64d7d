//! Integration tests for the file backend.

use chronicle_core::{
    bus::EventBus,
    event::{AggregateId, DomainEvent},
    event_store::{EventStore, EventStoreError},
    projection::PositionStore,
    store::{AppendError, AppendOnlyStore, NonEmpty, TimeRange},
};
use chronicle_file::{Error, FilePositionStore, FileStore};
use serde_json::json;
use tempfile::TempDir;

struct TestDir {
    dir: TempDir,
}

impl TestDir {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn store(&self) -> FileStore {
        FileStore::new(self.dir.path().join("nested").join("events.jsonl"))
    }
}

fn one(value: serde_json::Value) -> NonEmpty<serde_json::Value> {
    NonEmpty::new(value)
}

#[tokio::test]
async fn first_append_creates_directory_and_file() {
    let test = TestDir::new();
    let store = test.store();
    assert!(!store.path().exists());

    let records = store.append("counter:c1", one(json!({"n": 1})), 0).await.unwrap();

    assert!(store.path().exists());
    assert_eq!(records[0].id, 1);
    assert_eq!(records[0].version, 1);
}

#[tokio::test]
async fn reading_a_missing_file_yields_nothing() {
    let test = TestDir::new();
    let store = test.store();
    assert!(store.read_all_records(0, None).await.unwrap().is_empty());
    assert!(store.read_records("counter:c1", 0, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn one_record_per_line_in_camel_case() {
    let test = TestDir::new();
    let store = test.store();
    store
        .append(
            "counter:c1",
            NonEmpty::from((json!({"n": 1}), vec![json!({"n": 2})])),
            0,
        )
        .await
        .unwrap();

    let contents = std::fs::read_to_string(store.path()).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 2);

    let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(first["id"], 1);
    assert_eq!(first["streamId"], "counter:c1");
    assert_eq!(first["version"], 1);
    assert_eq!(first["data"], json!({"n": 1}));
    assert!(first["timestamp"].is_i64());
}

#[tokio::test]
async fn stale_version_is_rejected_and_nothing_written() {
    let test = TestDir::new();
    let store = test.store();
    store.append("counter:c1", one(json!(1)), 0).await.unwrap();
    store.append("counter:c1", one(json!(2)), 1).await.unwrap();

    let err = store
        .append("counter:c1", one(json!(3)), 0)
        .await
        .unwrap_err();
    match err {
        AppendError::Conflict(conflict) => {
            assert_eq!(conflict.stream_id, "counter:c1");
            assert_eq!(conflict.expected, 0);
            assert_eq!(conflict.actual, 2);
        }
        AppendError::Store(err) => panic!("expected a conflict, got {err}"),
    }
    assert_eq!(store.read_all_records(0, None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn a_reopened_store_continues_versions_and_ids() {
    let test = TestDir::new();
    let store = test.store();
    store.append("counter:a", one(json!(1)), 0).await.unwrap();
    store.append("counter:b", one(json!(1)), 0).await.unwrap();

    let reopened = test.store();
    let stale = reopened.append("counter:a", one(json!(2)), 0).await;
    assert!(matches!(stale, Err(AppendError::Conflict(_))));

    let records = reopened.append("counter:a", one(json!(2)), 1).await.unwrap();
    assert_eq!(records[0].id, 3);
    assert_eq!(records[0].version, 2);
}

#[tokio::test]
async fn stream_reads_filter_by_version_and_limit() {
    let test = TestDir::new();
    let store = test.store();
    for version in 0..4 {
        store
            .append("counter:a", one(json!(version)), version)
            .await
            .unwrap();
        store
            .append("counter:b", one(json!(version)), version)
            .await
            .unwrap();
    }

    let tail = store.read_records("counter:a", 2, None).await.unwrap();
    let versions: Vec<u64> = tail.iter().map(|r| r.version).collect();
    assert_eq!(versions, [3, 4]);

    let limited = store.read_records("counter:b", 0, Some(3)).await.unwrap();
    assert_eq!(limited.len(), 3);
    assert!(limited.iter().all(|r| r.stream_id == "counter:b"));

    let page = store.read_all_records(2, Some(3)).await.unwrap();
    let ids: Vec<u64> = page.iter().map(|r| r.id).collect();
    assert_eq!(ids, [3, 4, 5]);
}

#[tokio::test]
async fn range_bounds_are_exclusive() {
    let test = TestDir::new();
    let store = test.store();
    let records = store.append("counter:a", one(json!(1)), 0).await.unwrap();
    let ts = records[0].timestamp;

    let inside = store
        .read_all_records_in_range(TimeRange::default().after(ts - 1).before(ts + 1))
        .await
        .unwrap();
    assert_eq!(inside.len(), 1);

    let excluded = store
        .read_all_records_in_range(TimeRange::default().after(ts))
        .await
        .unwrap();
    assert!(excluded.is_empty());
}

#[tokio::test]
async fn malformed_line_reports_its_number() {
    let test = TestDir::new();
    let store = test.store();
    store.append("counter:a", one(json!(1)), 0).await.unwrap();

    let mut contents = std::fs::read_to_string(store.path()).unwrap();
    contents.push_str("{not json\n");
    std::fs::write(store.path(), contents).unwrap();

    let err = store.read_all_records(0, None).await.unwrap_err();
    match err {
        Error::Corrupt { line, .. } => assert_eq!(line, 2),
        other => panic!("expected a corrupt record error, got {other}"),
    }
}

#[tokio::test]
async fn torn_last_line_is_dropped_and_appends_continue() {
    let test = TestDir::new();
    let store = test.store();
    store.append("s:1", one(json!(1)), 0).await.unwrap();

    let mut contents = std::fs::read_to_string(store.path()).unwrap();
    contents.push_str(r#"{"id":2,"streamId":"s:1","ver"#);
    std::fs::write(store.path(), contents).unwrap();

    let reopened = test.store();
    assert_eq!(reopened.read_all_records(0, None).await.unwrap().len(), 1);

    let records = reopened.append("s:1", one(json!(2)), 1).await.unwrap();
    assert_eq!(records[0].id, 2);
    assert_eq!(records[0].version, 2);

    let contents = std::fs::read_to_string(store.path()).unwrap();
    assert!(contents.ends_with('\n'));
    let ids: Vec<u64> = test
        .store()
        .read_all_records(0, None)
        .await
        .unwrap()
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, [1, 2]);
}

#[tokio::test]
async fn complete_last_record_without_newline_is_kept() {
    let test = TestDir::new();
    let store = test.store();
    store.append("s:1", one(json!(1)), 0).await.unwrap();

    let contents = std::fs::read_to_string(store.path()).unwrap();
    std::fs::write(store.path(), contents.trim_end()).unwrap();

    let reopened = test.store();
    let records = reopened.append("s:1", one(json!(2)), 1).await.unwrap();
    assert_eq!(records[0].id, 2);

    let contents = std::fs::read_to_string(store.path()).unwrap();
    assert_eq!(contents.lines().count(), 2);
    assert_eq!(reopened.read_records("s:1", 0, None).await.unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_appends_at_the_same_version_have_one_winner() {
    let test = TestDir::new();
    let store = test.store();

    let attempts: Vec<_> = (0..8)
        .map(|n| {
            let store = store.clone();
            tokio::spawn(async move { store.append("counter:a", one(json!(n)), 0).await })
        })
        .collect();

    let mut winners = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(_) => winners += 1,
            Err(AppendError::Conflict(conflict)) => assert_eq!(conflict.actual, 1),
            Err(AppendError::Store(err)) => panic!("unexpected store error: {err}"),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(store.read_all_records(0, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn event_store_round_trips_through_the_file() {
    let test = TestDir::new();
    let events = EventStore::new(test.store(), EventBus::new());
    let id = AggregateId::new("counter", "c1");

    events
        .save(
            &id,
            vec![
                DomainEvent::bare("incremented"),
                DomainEvent::new("incrementedBy", json!({ "by": 4 })),
            ],
            0,
            Some(json!({ "user": "ada" })),
        )
        .await
        .unwrap();

    let reloaded = EventStore::new(test.store(), EventBus::new());
    let loaded = reloaded.load_events(&id, 0).await.unwrap();
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded[1].name(), "incrementedBy");
    assert_eq!(loaded[1].event.field("by"), &json!(4));
    assert_eq!(loaded[1].metadata, Some(json!({ "user": "ada" })));

    let err = reloaded
        .save(&id, vec![DomainEvent::bare("incremented")], 1, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EventStoreError::Concurrency(_)));
}

#[tokio::test]
async fn positions_survive_a_new_store_instance() {
    let test = TestDir::new();
    let dir = test.dir.path().join("positions");

    let positions = FilePositionStore::new(&dir);
    positions.update("totals", 7).await.unwrap();
    positions.update("totals", 9).await.unwrap();
    positions.update("other", 1).await.unwrap();

    let reopened = FilePositionStore::new(&dir);
    assert_eq!(reopened.load("totals").await.unwrap(), 9);
    assert_eq!(reopened.load("other").await.unwrap(), 1);
    assert_eq!(reopened.load("missing").await.unwrap(), 0);
}
