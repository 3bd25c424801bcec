//! Read-through cache for single durable documents.
//!
//! Resolved documents are served from memory. Concurrent misses on the same
//! path share one upstream fetch, which runs as its own task so that a waiter
//! losing interest never cancels it for everyone else.

use chatpresence_core::{
    CacheConfig, ChatPresenceError, Document, DocumentSource, DomainError, Fields,
};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use thiserror::Error;

const ID_FIELD: &str = "id";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("invalid document path {path}: {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("fetch of {path} failed: {reason}")]
    Fetch { path: String, reason: String },
    #[error("fetch of {path} did not complete: {reason}")]
    Aborted { path: String, reason: String },
}

impl CacheError {
    fn from_store(path: &str, err: ChatPresenceError) -> Self {
        match err {
            ChatPresenceError::Domain(DomainError::InvalidPath { path, reason }) => {
                Self::InvalidPath { path, reason }
            }
            other => Self::Fetch {
                path: path.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

/// Snapshot of a document as first loaded; `fields` carries the `id` too
#[derive(Debug, Clone, PartialEq)]
pub struct CachedDocument {
    pub path: String,
    pub id: String,
    pub fields: Fields,
}

impl CachedDocument {
    pub fn from_document(path: &str, document: Document) -> Self {
        let mut fields = document.fields;
        fields.insert(ID_FIELD.to_string(), JsonValue::String(document.id.clone()));
        Self {
            path: path.to_string(),
            id: document.id,
            fields,
        }
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.fields.get(field)
    }

    pub fn to_value(&self) -> JsonValue {
        JsonValue::Object(self.fields.clone())
    }
}

pub type FetchResult = Result<Arc<CachedDocument>, CacheError>;
type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

/// A caller's handle on an in-flight fetch. Dropping it only withdraws this
/// caller's interest.
pub struct PendingDocument {
    path: String,
    fetch: SharedFetch,
}

impl PendingDocument {
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Future for PendingDocument {
    type Output = FetchResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.fetch.poll_unpin(cx)
    }
}

/// Outcome of `DocumentCache::get`
pub enum Lookup {
    /// Served from memory, no suspension
    Ready(Arc<CachedDocument>),
    /// Not loaded yet; resolves once the shared fetch completes
    Pending(PendingDocument),
}

impl Lookup {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn ready(&self) -> Option<&Arc<CachedDocument>> {
        match self {
            Self::Ready(doc) => Some(doc),
            Self::Pending(_) => None,
        }
    }

    pub async fn resolve(self) -> FetchResult {
        match self {
            Self::Ready(doc) => Ok(doc),
            Self::Pending(pending) => pending.await,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// `get` served from the resolved map
    pub hits: u64,
    /// `get` that started an upstream fetch
    pub misses: u64,
    /// `get` that attached to a fetch already in flight
    pub coalesced: u64,
    /// Fetches that ended in an error
    pub failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    failures: AtomicU64,
}

#[derive(Default)]
struct CacheState {
    resolved: HashMap<String, Arc<CachedDocument>>,
    /// Insertion order of `resolved`, oldest first
    order: VecDeque<String>,
    in_flight: HashMap<String, SharedFetch>,
}

impl CacheState {
    fn insert(&mut self, doc: Arc<CachedDocument>, max_entries: Option<usize>) {
        if self.resolved.insert(doc.path.clone(), doc.clone()).is_none() {
            self.order.push_back(doc.path.clone());
        }
        let Some(max) = max_entries else {
            return;
        };
        while self.resolved.len() > max {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.resolved.remove(&oldest);
            tracing::debug!("Evicted {} from document cache", oldest);
        }
    }
}

fn lock(state: &Mutex<CacheState>) -> MutexGuard<'_, CacheState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Clears the in-flight entry even if the fetch task panics before completing.
struct InFlightGuard {
    state: Arc<Mutex<CacheState>>,
    path: String,
    completed: bool,
}

impl InFlightGuard {
    fn complete(mut self, result: &FetchResult, max_entries: Option<usize>) {
        let mut state = lock(&self.state);
        state.in_flight.remove(&self.path);
        if let Ok(doc) = result {
            state.insert(doc.clone(), max_entries);
        }
        self.completed = true;
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if !self.completed {
            lock(&self.state).in_flight.remove(&self.path);
        }
    }
}

/// Per-instance document cache; inject one per consumer scope.
///
/// `get` spawns fetches on the ambient tokio runtime.
pub struct DocumentCache {
    source: Arc<dyn DocumentSource>,
    state: Arc<Mutex<CacheState>>,
    counters: Arc<Counters>,
    max_entries: Option<usize>,
}

impl DocumentCache {
    pub fn new(source: Arc<dyn DocumentSource>) -> Self {
        Self {
            source,
            state: Arc::new(Mutex::new(CacheState::default())),
            counters: Arc::new(Counters::default()),
            max_entries: None,
        }
    }

    pub fn with_config(source: Arc<dyn DocumentSource>, config: &CacheConfig) -> Self {
        Self::new(source).with_max_entries(config.max_entries)
    }

    pub fn with_max_entries(mut self, max_entries: Option<usize>) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Look up `path`, attaching to or starting an upstream fetch on a miss.
    pub fn get(&self, path: &str) -> Lookup {
        let mut state = lock(&self.state);

        if let Some(doc) = state.resolved.get(path) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Lookup::Ready(doc.clone());
        }

        if let Some(fetch) = state.in_flight.get(path) {
            self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Joining in-flight fetch of {}", path);
            return Lookup::Pending(PendingDocument {
                path: path.to_string(),
                fetch: fetch.clone(),
            });
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        // Spawned and registered under the same lock: no second fetch can slip in
        let fetch = self.start_fetch(path);
        state.in_flight.insert(path.to_string(), fetch.clone());
        Lookup::Pending(PendingDocument {
            path: path.to_string(),
            fetch,
        })
    }

    /// `get`, waiting for the document if it is not resolved yet.
    pub async fn load(&self, path: &str) -> FetchResult {
        self.get(path).resolve().await
    }

    pub fn peek(&self, path: &str) -> Option<Arc<CachedDocument>> {
        lock(&self.state).resolved.get(path).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).resolved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight_len(&self) -> usize {
        lock(&self.state).in_flight.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    fn start_fetch(&self, path: &str) -> SharedFetch {
        let source = self.source.clone();
        let counters = self.counters.clone();
        let max_entries = self.max_entries;
        let guard = InFlightGuard {
            state: self.state.clone(),
            path: path.to_string(),
            completed: false,
        };
        let owned = path.to_string();
        tracing::debug!("Fetching {}", path);

        let task = tokio::spawn(async move {
            let result = match source.fetch(&owned).await {
                Ok(Some(document)) => Ok(Arc::new(CachedDocument::from_document(&owned, document))),
                Ok(None) => Err(CacheError::NotFound(owned.clone())),
                Err(e) => Err(CacheError::from_store(&owned, e)),
            };
            if let Err(e) = &result {
                counters.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Document fetch failed: {}", e);
            }
            guard.complete(&result, max_entries);
            result
        });

        let path = path.to_string();
        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(CacheError::Aborted {
                    path,
                    reason: e.to_string(),
                }),
            }
        }
        .boxed()
        .shared()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chatpresence_core::InMemoryDurableStore;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Semaphore;

    /// Holds every fetch until the test releases it; can fail the first N.
    struct GatedSource {
        store: InMemoryDurableStore,
        gate: Semaphore,
        reads: AtomicUsize,
        failures: AtomicUsize,
    }

    impl GatedSource {
        fn new(failures: usize) -> Self {
            Self {
                store: InMemoryDurableStore::new(),
                gate: Semaphore::new(0),
                reads: AtomicUsize::new(0),
                failures: AtomicUsize::new(failures),
            }
        }

        async fn seed(&self, path: &str, value: JsonValue) {
            let JsonValue::Object(fields) = value else {
                panic!("expected object");
            };
            self.store.insert(path, fields).await.unwrap();
        }

        fn release(&self, n: usize) {
            self.gate.add_permits(n);
        }

        fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DocumentSource for GatedSource {
        async fn fetch(&self, path: &str) -> Result<Option<Document>, ChatPresenceError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.gate.acquire().await.unwrap().forget();
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(ChatPresenceError::store_error("durable", "deadline exceeded"));
            }
            self.store.fetch(path).await
        }
    }

    async fn settle<F: Fn() -> bool>(done: F) {
        for _ in 0..1000 {
            if done() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("cache never settled");
    }

    #[tokio::test]
    async fn test_concurrent_gets_share_one_fetch() {
        let source = Arc::new(GatedSource::new(0));
        source.seed("users/42", json!({ "displayName": "Ada" })).await;
        let cache = DocumentCache::new(source.clone());

        let first = cache.get("users/42");
        let second = cache.get("users/42");
        let third = cache.get("users/42");
        assert!(!first.is_ready() && !second.is_ready() && !third.is_ready());
        assert_eq!(cache.in_flight_len(), 1);

        source.release(1);
        let (a, b, c) = tokio::join!(first.resolve(), second.resolve(), third.resolve());
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

        assert_eq!(source.reads(), 1);
        assert!(Arc::ptr_eq(&a, &b) && Arc::ptr_eq(&b, &c));
        assert_eq!(a.get("displayName"), Some(&json!("Ada")));
        assert_eq!(a.get("id"), Some(&json!("42")));
        assert_eq!(cache.in_flight_len(), 0);

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.coalesced, 2);
    }

    #[tokio::test]
    async fn test_resolved_document_is_served_synchronously() {
        let source = Arc::new(GatedSource::new(0));
        source.seed("users/42", json!({ "displayName": "Ada" })).await;
        let cache = DocumentCache::new(source.clone());

        source.release(1);
        cache.load("users/42").await.unwrap();

        let lookup = cache.get("users/42");
        assert_eq!(lookup.ready().map(|doc| doc.id.as_str()), Some("42"));
        assert_eq!(source.reads(), 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_failure_is_not_cached_and_next_get_retries() {
        let source = Arc::new(GatedSource::new(1));
        source.seed("users/42", json!({ "displayName": "Ada" })).await;
        let cache = DocumentCache::new(source.clone());

        let waiting = cache.get("users/42");
        let joined = cache.get("users/42");
        source.release(1);
        let err = waiting.resolve().await.unwrap_err();
        assert!(matches!(err, CacheError::Fetch { .. }));
        assert_eq!(joined.resolve().await.unwrap_err(), err);

        assert!(cache.peek("users/42").is_none());
        assert_eq!(cache.in_flight_len(), 0);
        assert_eq!(cache.stats().failures, 1);

        source.release(1);
        let doc = cache.load("users/42").await.unwrap();
        assert_eq!(doc.id, "42");
        assert_eq!(source.reads(), 2);
    }

    #[tokio::test]
    async fn test_dropped_waiters_do_not_cancel_the_fetch() {
        let source = Arc::new(GatedSource::new(0));
        source.seed("users/42", json!({ "displayName": "Ada" })).await;
        let cache = DocumentCache::new(source.clone());

        drop(cache.get("users/42"));
        source.release(1);
        settle(|| cache.peek("users/42").is_some()).await;

        assert_eq!(cache.in_flight_len(), 0);
        assert!(cache.get("users/42").is_ready());
        assert_eq!(source.reads(), 1);
    }

    #[tokio::test]
    async fn test_missing_document_is_not_cached() {
        let source = Arc::new(GatedSource::new(0));
        let cache = DocumentCache::new(source.clone());

        source.release(1);
        let err = cache.load("users/404").await.unwrap_err();
        assert_eq!(err, CacheError::NotFound("users/404".to_string()));

        source.seed("users/404", json!({ "displayName": "Late" })).await;
        source.release(1);
        assert_eq!(cache.load("users/404").await.unwrap().id, "404");
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest_entry() {
        let source = Arc::new(GatedSource::new(0));
        for id in ["a", "b", "c"] {
            source.seed(&format!("users/{}", id), json!({})).await;
        }
        let cache = DocumentCache::new(source.clone()).with_max_entries(Some(2));

        source.release(3);
        for id in ["a", "b", "c"] {
            cache.load(&format!("users/{}", id)).await.unwrap();
        }

        assert_eq!(cache.len(), 2);
        assert!(cache.peek("users/a").is_none());
        assert!(cache.peek("users/b").is_some());
        assert!(cache.peek("users/c").is_some());
    }

    #[test]
    fn test_store_errors_map_to_cache_errors() {
        let err = CacheError::from_store(
            "users",
            ChatPresenceError::invalid_path("users", "not a document"),
        );
        assert!(matches!(err, CacheError::InvalidPath { .. }));

        let err = CacheError::from_store("users/1", ChatPresenceError::Other("boom".to_string()));
        assert_eq!(
            err,
            CacheError::Fetch {
                path: "users/1".to_string(),
                reason: "Error: boom".to_string(),
            }
        );
    }
}
