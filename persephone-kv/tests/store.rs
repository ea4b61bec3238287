//! Store behavior observed through the public API only.

use std::sync::Arc;

use futures::StreamExt;
use persephone_kv::{
    Event, InMemoryKeyValueStore, KeyValueStore, MonotonicVersion, StoreError, Version, Versioned,
};

type Store = InMemoryKeyValueStore<String, u32>;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_stale_writers_exactly_one_wins() {
    let store = Arc::new(Store::new());
    let key = "blocks/sddc-net".to_string();
    store.set(key.clone(), MonotonicVersion(0), 0).await.unwrap();
    let observed = store.get(key.clone()).await.unwrap().version();

    let writers: Vec<_> = (1..=2)
        .map(|writer| {
            let store = Arc::clone(&store);
            let key = key.clone();
            tokio::spawn(async move { store.set(key, observed, writer).await })
        })
        .collect();

    let mut results = Vec::new();
    for writer in writers {
        results.push(writer.await.unwrap());
    }

    let winners = results.iter().filter(|result| result.is_ok()).count();
    assert_eq!(winners, 1);

    let loser = results
        .iter()
        .find_map(|result| result.as_ref().err())
        .unwrap();
    assert_eq!(
        loser,
        &StoreError::VersionMismatch {
            expected: MonotonicVersion(1),
            actual: MonotonicVersion(2),
        }
    );
    assert_eq!(
        store.get(key).await.unwrap().version(),
        MonotonicVersion(2)
    );
}

#[tokio::test]
async fn test_replay_precedes_live_events() {
    let store = Store::new();
    for (i, key) in ["a", "b", "c"].into_iter().enumerate() {
        store
            .set(key.to_string(), MonotonicVersion::initial(), i as u32)
            .await
            .unwrap();
    }
    store
        .set("b".to_string(), MonotonicVersion(1), 10)
        .await
        .unwrap();

    let mut events = store.subscribe(4, true).await.unwrap();
    store
        .set("d".to_string(), MonotonicVersion::initial(), 3)
        .await
        .unwrap();

    let mut received = Vec::new();
    for _ in 0..4 {
        received.push(events.next().await.unwrap().unwrap());
    }

    assert_eq!(
        received,
        vec![
            Event::Change {
                key: "a".into(),
                value: 0,
                version: MonotonicVersion(1)
            },
            Event::Change {
                key: "b".into(),
                value: 10,
                version: MonotonicVersion(2)
            },
            Event::Change {
                key: "c".into(),
                value: 2,
                version: MonotonicVersion(1)
            },
            Event::Change {
                key: "d".into(),
                value: 3,
                version: MonotonicVersion(1)
            },
        ]
    );
}

#[tokio::test]
async fn test_replay_skips_deleted_keys() {
    let store = Store::new();
    store.set("gone".into(), MonotonicVersion(0), 1).await.unwrap();
    store.set("kept".into(), MonotonicVersion(0), 2).await.unwrap();
    store.delete("gone".into(), MonotonicVersion(1)).await.unwrap();

    let events = store.subscribe(1, true).await.unwrap();
    store.close().await;

    let keys: Vec<_> = events
        .filter_map(|event| async move { event.ok().map(|event| event.key().clone()) })
        .collect()
        .await;
    assert_eq!(keys, vec!["kept".to_string()]);
}

#[tokio::test]
async fn test_subscribers_have_independent_cursors() {
    let store = Store::new();
    let mut early = store.subscribe(8, false).await.unwrap();
    store.set("x".into(), MonotonicVersion(0), 1).await.unwrap();
    let mut late = store.subscribe(8, false).await.unwrap();
    store.set("x".into(), MonotonicVersion(1), 2).await.unwrap();

    let first = early.next().await.unwrap().unwrap();
    let second = early.next().await.unwrap().unwrap();
    let only = late.next().await.unwrap().unwrap();

    assert!(matches!(first, Event::Change { value: 1, .. }));
    assert!(matches!(second, Event::Change { value: 2, .. }));
    assert_eq!(only, second);
}

#[tokio::test]
async fn test_recreated_key_restarts_at_initial_version() {
    let store = Store::new();
    store.set("k".into(), MonotonicVersion(0), 1).await.unwrap();
    store.delete("k".into(), MonotonicVersion(1)).await.unwrap();

    let previous = store.set("k".into(), MonotonicVersion(0), 2).await.unwrap();
    assert_eq!(previous, Versioned::None);
    assert_eq!(
        store.get("k".into()).await.unwrap().version(),
        MonotonicVersion(1)
    );
}
