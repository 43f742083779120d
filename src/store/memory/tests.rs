use super::*;
use crate::store::ChangeKind;
use serde_json::json;
use std::time::Duration;

fn new_record(origin: &str, namespace: &str) -> NewRecord {
    NewRecord {
        origin_id: origin.to_string(),
        namespace: namespace.to_string(),
        event: json!({"type": "woot"}),
        delivery_options: json!({"rooms": null, "except": [], "flags": {}}),
    }
}

async fn next_change(stream: &mut ChangeStream) -> Change {
    tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("timed out waiting for change")
        .expect("stream ended")
        .expect("stream error")
}

#[tokio::test]
async fn test_insert_without_streams() {
    let store = MemoryLogStore::new();
    let mut conn = store.connect().await.unwrap();

    let id = conn
        .insert(new_record("p#aaaaaa", "/"), Durability::Soft)
        .await
        .unwrap();

    assert!(store.contains(&id).await);
    assert_eq!(store.records().await.len(), 1);
}

#[tokio::test]
async fn test_insert_then_delete_emits_both_changes() {
    let store = MemoryLogStore::new();
    let watcher = store.connect().await.unwrap();
    let mut stream = watcher.changes(ChangeFilter::all()).await.unwrap();

    let mut conn = store.connect().await.unwrap();
    let id = conn
        .insert(new_record("p#aaaaaa", "/"), Durability::Hard)
        .await
        .unwrap();
    let removed = conn.delete(&[id.clone()], Durability::Hard).await.unwrap();
    assert_eq!(removed, 1);

    let inserted = next_change(&mut stream).await;
    assert_eq!(inserted.kind(), ChangeKind::Insert);
    assert_eq!(inserted.new.as_ref().unwrap().id, id);

    let deleted = next_change(&mut stream).await;
    assert_eq!(deleted.kind(), ChangeKind::Delete);
    assert_eq!(deleted.old.as_ref().unwrap().id, id);

    assert!(store.records().await.is_empty());
}

#[tokio::test]
async fn test_filter_is_applied_before_delivery() {
    let store = MemoryLogStore::new();
    let watcher = store.connect().await.unwrap();
    let mut stream = watcher
        .changes(ChangeFilter::excluding_origin("p#self01"))
        .await
        .unwrap();

    let mut conn = store.connect().await.unwrap();
    conn.insert(new_record("p#self01", "/"), Durability::Soft)
        .await
        .unwrap();
    let peer = conn
        .insert(new_record("p#peer02", "/"), Durability::Soft)
        .await
        .unwrap();

    let change = next_change(&mut stream).await;
    assert_eq!(change.new.unwrap().id, peer);
}

#[tokio::test]
async fn test_delete_unknown_id_removes_nothing() {
    let store = MemoryLogStore::new();
    let mut conn = store.connect().await.unwrap();
    conn.insert(new_record("p#aaaaaa", "/"), Durability::Soft)
        .await
        .unwrap();

    let removed = conn
        .delete(&[RecordId("missing".to_string())], Durability::Soft)
        .await
        .unwrap();

    assert_eq!(removed, 0);
    assert_eq!(store.records().await.len(), 1);
}

#[tokio::test]
async fn test_open_connections_tracks_close_and_drop() {
    let store = MemoryLogStore::new();
    let mut first = store.connect().await.unwrap();
    let second = store.connect().await.unwrap();
    assert_eq!(store.open_connections(), 2);

    first.close().await.unwrap();
    assert_eq!(store.open_connections(), 1);

    drop(second);
    assert_eq!(store.open_connections(), 0);
}

#[tokio::test]
async fn test_closed_connection_rejects_operations() {
    let store = MemoryLogStore::new();
    let mut conn = store.connect().await.unwrap();
    conn.close().await.unwrap();

    let result = conn
        .insert(new_record("p#aaaaaa", "/"), Durability::Soft)
        .await;
    assert!(matches!(result, Err(StoreError::Connection(_))));
}

#[tokio::test]
async fn test_fail_flags() {
    let store = MemoryLogStore::new();

    store.set_fail_on_init(true).await;
    assert!(store.init().await.is_err());

    store.set_fail_on_connect(true).await;
    assert!(matches!(
        store.connect().await.err(),
        Some(StoreError::Connection(_))
    ));
    store.set_fail_on_connect(false).await;

    store.set_fail_on_insert(true).await;
    let mut conn = store.connect().await.unwrap();
    assert!(conn
        .insert(new_record("p#aaaaaa", "/"), Durability::Soft)
        .await
        .is_err());
    assert!(store.records().await.is_empty());
}

#[tokio::test]
async fn test_close_streams_ends_open_streams() {
    let store = MemoryLogStore::new();
    let watcher = store.connect().await.unwrap();
    let mut stream = watcher.changes(ChangeFilter::all()).await.unwrap();

    store.close_streams();

    let next = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("stream did not end");
    assert!(next.is_none());

    let reopened = store
        .connect()
        .await
        .unwrap()
        .changes(ChangeFilter::all())
        .await;
    assert!(matches!(reopened.err(), Some(StoreError::StreamClosed)));
}

#[tokio::test]
async fn test_inject_reaches_streams_without_touching_table() {
    let store = MemoryLogStore::new();
    let watcher = store.connect().await.unwrap();
    let mut stream = watcher.changes(ChangeFilter::all()).await.unwrap();

    let record = LogRecord::from_new(RecordId("x".to_string()), new_record("p#peer02", "/"));
    store.inject(Change::insert(record.clone()));

    let change = next_change(&mut stream).await;
    assert_eq!(change.new, Some(record));
    assert!(store.records().await.is_empty());
}

#[tokio::test]
async fn test_changes_releases_connection() {
    let store = MemoryLogStore::new();
    let mut streams = Vec::new();
    for _ in 0..5 {
        let watcher = store.connect().await.unwrap();
        streams.push(watcher.changes(ChangeFilter::all()).await.unwrap());
    }
    assert_eq!(store.open_connections(), 0);

    let mut conn = store.connect().await.unwrap();
    let id = conn
        .insert(new_record("p#peer02", "/"), Durability::Soft)
        .await
        .unwrap();
    conn.close().await.unwrap();

    for stream in &mut streams {
        assert_eq!(next_change(stream).await.new.unwrap().id, id);
    }
}

#[tokio::test]
async fn test_writes_record_requested_durability() {
    let store = MemoryLogStore::new();
    let mut conn = store.connect().await.unwrap();

    let id = conn
        .insert(new_record("p#aaaaaa", "/"), Durability::Hard)
        .await
        .unwrap();
    conn.delete(&[id], Durability::Soft).await.unwrap();

    assert_eq!(
        store.durabilities().await,
        vec![Durability::Hard, Durability::Soft]
    );
}
