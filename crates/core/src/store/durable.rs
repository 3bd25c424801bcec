// In-memory durable store
//
// Document store keyed by path. Merge writes replace top-level fields and
// create the document when it is missing.

use super::{DocumentSource, DurableStore};
use crate::document::{self, Document, Fields};
use crate::error::ChatPresenceError;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

pub struct InMemoryDurableStore {
    documents: RwLock<HashMap<String, Fields>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl InMemoryDurableStore {
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// Seed or replace a whole document
    pub async fn insert(&self, path: &str, fields: Fields) -> Result<(), ChatPresenceError> {
        document::validate_document_path(path)?;
        let mut documents = self.documents.write().await;
        documents.insert(path.to_string(), fields);
        Ok(())
    }

    /// Snapshot without counting as an upstream read
    pub async fn document(&self, path: &str) -> Option<Document> {
        let documents = self.documents.read().await;
        documents
            .get(path)
            .map(|fields| Document::new(document::document_id(path), fields.clone()))
    }

    /// Number of `fetch` calls served
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of `merge_write` calls applied
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn server_now() -> JsonValue {
        JsonValue::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
    }
}

impl Default for InMemoryDurableStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentSource for InMemoryDurableStore {
    async fn fetch(&self, path: &str) -> Result<Option<Document>, ChatPresenceError> {
        document::validate_document_path(path)?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.document(path).await)
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn merge_write(&self, path: &str, fields: Fields) -> Result<(), ChatPresenceError> {
        document::validate_document_path(path)?;
        let now = Self::server_now();
        let mut documents = self.documents.write().await;
        let target = documents.entry(path.to_string()).or_default();
        for (name, mut value) in fields {
            document::resolve_server_timestamps(&mut value, &now);
            target.insert(name, value);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
