use super::*;
use crate::broadcaster::RoomBroadcaster;
use crate::record::NewRecord;
use crate::relay::publisher::Retention;
use crate::store::{Durability, MemoryLogStore};
use serde_json::json;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

fn origin() -> OriginId {
    OriginId::from_parts("socket.io", "adapt1")
}

fn start(
    store: &MemoryLogStore,
    namespace: &str,
    retention: Retention,
    broadcaster: Arc<RoomBroadcaster>,
) -> RelayAdapter {
    let shared: Arc<dyn LogStore> = Arc::new(store.clone());
    let publish_store = Arc::clone(&shared);
    RelayAdapter::start(
        namespace,
        origin(),
        shared,
        move |namespace| {
            Publisher::new(
                publish_store,
                origin(),
                namespace,
                retention,
                Durability::Soft,
            )
        },
        broadcaster,
    )
}

fn event(kind: &str) -> Payload {
    Payload::object([("type", Payload::from(kind))])
}

async fn insert_from_peer(store: &MemoryLogStore, namespace: &str, kind: &str) {
    let mut conn = store.connect().await.unwrap();
    conn.insert(
        NewRecord {
            origin_id: "socket.io#peer02".to_string(),
            namespace: namespace.to_string(),
            event: json!({"type": kind}),
            delivery_options: json!({"rooms": null, "except": [], "flags": {}}),
        },
        Durability::Soft,
    )
    .await
    .unwrap();
    conn.close().await.unwrap();
}

async fn wait_for_state(adapter: &RelayAdapter, expected: AdapterState) {
    let mut states = adapter.watch_state();
    tokio::time::timeout(WAIT, states.wait_for(|state| *state == expected))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_ready_resolves_ok() {
    let store = MemoryLogStore::new();
    let adapter = start(&store, "/", Retention::Delete, Arc::new(RoomBroadcaster::new()));

    tokio::time::timeout(WAIT, adapter.ready())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(adapter.state(), AdapterState::Ready);
    assert_eq!(adapter.namespace(), "/");
    assert_eq!(adapter.origin().key(), "socket.io#adapt1");
}

#[tokio::test]
async fn test_local_delivery_before_ready() {
    let store = MemoryLogStore::new();
    let broadcaster = Arc::new(RoomBroadcaster::new());
    broadcaster.connect("/", "s1");
    let adapter = start(&store, "/", Retention::Delete, Arc::clone(&broadcaster));

    // Nothing has been awaited yet; the driver task has not run.
    let ticket = adapter.broadcast(event("early"), DeliveryOptions::everyone(), false);

    assert_eq!(
        broadcaster.deliveries("s1"),
        vec![(event("early"), DeliveryOrigin::Local)]
    );
    let outcome = tokio::time::timeout(WAIT, ticket.unwrap().outcome())
        .await
        .unwrap()
        .unwrap();
    assert!(!outcome.retained);
}

#[tokio::test]
async fn test_remote_broadcast_is_not_published() {
    let store = MemoryLogStore::new();
    let broadcaster = Arc::new(RoomBroadcaster::new());
    broadcaster.connect("/", "s1");
    let adapter = start(&store, "/", Retention::Keep, Arc::clone(&broadcaster));
    adapter.ready().await.unwrap();

    let ticket = adapter.broadcast(event("relayed"), DeliveryOptions::everyone(), true);

    assert!(ticket.is_none());
    assert_eq!(
        broadcaster.deliveries("s1"),
        vec![(event("relayed"), DeliveryOrigin::Remote)]
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.records().await.is_empty());
}

#[tokio::test]
async fn test_queued_publishes_keep_call_order() {
    let store = MemoryLogStore::new();
    let adapter = start(&store, "/", Retention::Keep, Arc::new(RoomBroadcaster::new()));

    let tickets: Vec<_> = (0..5)
        .map(|i| {
            adapter
                .broadcast(event(&format!("e{}", i)), DeliveryOptions::everyone(), false)
                .unwrap()
        })
        .collect();
    for ticket in tickets {
        tokio::time::timeout(WAIT, ticket.outcome())
            .await
            .unwrap()
            .unwrap();
    }

    let kinds: Vec<_> = store
        .records()
        .await
        .into_iter()
        .map(|record| record.event["type"].clone())
        .collect();
    assert_eq!(kinds, vec!["e0", "e1", "e2", "e3", "e4"]);
}

#[tokio::test]
async fn test_peer_records_are_delivered_as_remote() {
    let store = MemoryLogStore::new();
    let broadcaster = Arc::new(RoomBroadcaster::new());
    broadcaster.connect("/chat", "s1");
    let adapter = start(&store, "chat", Retention::Delete, Arc::clone(&broadcaster));
    adapter.ready().await.unwrap();
    assert_eq!(adapter.namespace(), "/chat");

    insert_from_peer(&store, "/other", "elsewhere").await;
    insert_from_peer(&store, "/chat", "hello").await;

    tokio::time::timeout(WAIT, async {
        while broadcaster.deliveries("s1").is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(
        broadcaster.deliveries("s1"),
        vec![(event("hello"), DeliveryOrigin::Remote)]
    );
}

#[tokio::test]
async fn test_init_failure_fails_adapter() {
    let store = MemoryLogStore::new();
    store.set_fail_on_init(true).await;
    let broadcaster = Arc::new(RoomBroadcaster::new());
    broadcaster.connect("/", "s1");
    let adapter = start(&store, "/", Retention::Delete, Arc::clone(&broadcaster));
    let mut errors = adapter.errors();

    let ticket = adapter
        .broadcast(event("queued"), DeliveryOptions::everyone(), false)
        .unwrap();

    let err = tokio::time::timeout(WAIT, adapter.ready())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(*err, RelayError::Initialization(_)));
    assert_eq!(adapter.state(), AdapterState::Failed);
    assert!(matches!(
        *errors.recv().await.unwrap(),
        RelayError::Initialization(_)
    ));

    let err = ticket.outcome().await.unwrap_err();
    assert!(matches!(*err, RelayError::NotReady(AdapterState::Failed)));

    // Local delivery still works.
    adapter.broadcast(event("later"), DeliveryOptions::everyone(), false);
    assert_eq!(broadcaster.received("s1"), vec![event("queued"), event("later")]);
}

#[tokio::test]
async fn test_stream_end_fails_adapter() {
    let store = MemoryLogStore::new();
    let adapter = start(&store, "/", Retention::Delete, Arc::new(RoomBroadcaster::new()));
    adapter.ready().await.unwrap();
    let mut errors = adapter.errors();

    store.close_streams();

    wait_for_state(&adapter, AdapterState::Failed).await;
    assert!(matches!(
        *errors.recv().await.unwrap(),
        RelayError::StreamTerminated
    ));
    // Readiness stays resolved as it first was.
    assert!(adapter.ready().await.is_ok());
}

#[tokio::test]
async fn test_publish_failure_is_emitted() {
    let store = MemoryLogStore::new();
    let broadcaster = Arc::new(RoomBroadcaster::new());
    broadcaster.connect("/", "s1");
    let adapter = start(&store, "/", Retention::Delete, Arc::clone(&broadcaster));
    adapter.ready().await.unwrap();
    let mut errors = adapter.errors();
    store.set_fail_on_insert(true).await;

    let ticket = adapter
        .broadcast(event("lost"), DeliveryOptions::everyone(), false)
        .unwrap();

    let err = ticket.outcome().await.unwrap_err();
    assert!(matches!(*err, RelayError::Publish(_)));
    assert!(matches!(*errors.recv().await.unwrap(), RelayError::Publish(_)));
    assert_eq!(broadcaster.received("s1"), vec![event("lost")]);
    assert_eq!(adapter.state(), AdapterState::Ready);
}

#[tokio::test]
async fn test_close_stops_relaying() {
    let store = MemoryLogStore::new();
    let broadcaster = Arc::new(RoomBroadcaster::new());
    broadcaster.connect("/", "s1");
    let adapter = start(&store, "/", Retention::Keep, Arc::clone(&broadcaster));
    adapter.ready().await.unwrap();

    adapter.close();
    assert_eq!(adapter.state(), AdapterState::Closed);

    let ticket = adapter
        .broadcast(event("after-close"), DeliveryOptions::everyone(), false)
        .unwrap();
    let err = ticket.outcome().await.unwrap_err();
    assert!(matches!(*err, RelayError::NotReady(AdapterState::Closed)));
    assert_eq!(broadcaster.received("s1"), vec![event("after-close")]);
    assert!(store.records().await.is_empty());
}

#[tokio::test]
async fn test_close_before_ready_resolves_not_ready() {
    let store = MemoryLogStore::new();
    let adapter = start(&store, "/", Retention::Delete, Arc::new(RoomBroadcaster::new()));

    adapter.close();

    let err = adapter.ready().await.unwrap_err();
    assert!(matches!(*err, RelayError::NotReady(AdapterState::Closed)));
}
