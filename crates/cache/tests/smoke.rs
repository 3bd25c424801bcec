use chatpresence_cache::{CacheError, DocumentCache, Lookup};
use chatpresence_core::{CacheConfig, DocumentSource, InMemoryDurableStore};
use serde_json::json;
use std::sync::Arc;

async fn seeded_store() -> Arc<InMemoryDurableStore> {
    let store = Arc::new(InMemoryDurableStore::new());
    let serde_json::Value::Object(fields) = json!({ "displayName": "Ada", "status": null }) else {
        unreachable!()
    };
    store.insert("users/42", fields).await.expect("seed");
    store
}

#[tokio::test]
async fn cache_smoke_load_then_hit() {
    let store = seeded_store().await;
    let cache = DocumentCache::new(store.clone());
    assert!(cache.is_empty());

    let doc = cache.load("users/42").await.expect("load");
    assert_eq!(doc.id, "42");
    assert_eq!(doc.to_value()["displayName"], json!("Ada"));
    assert_eq!(store.read_count(), 1);

    match cache.get("users/42") {
        Lookup::Ready(hit) => assert!(Arc::ptr_eq(&hit, &doc)),
        Lookup::Pending(_) => panic!("expected a resolved document"),
    }
    assert_eq!(store.read_count(), 1);
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn cache_smoke_invalid_path_is_reported() {
    let store = seeded_store().await;
    let cache = DocumentCache::with_config(store, &CacheConfig::default());

    let err = cache.load("users").await.unwrap_err();
    assert!(matches!(err, CacheError::InvalidPath { .. }));
    assert_eq!(cache.in_flight_len(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cache_smoke_parallel_loads_read_once() {
    let store = seeded_store().await;
    let cache = Arc::new(DocumentCache::new(store.clone() as Arc<dyn DocumentSource>));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.load("users/42").await })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.expect("join").expect("load").id, "42");
    }

    assert_eq!(store.read_count(), 1);
    let stats = cache.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits + stats.coalesced, 15);
}
