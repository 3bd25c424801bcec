// Store Interfaces
//
// Narrow boundaries to the two external stores. The core only ever talks to
// them through these traits; `ephemeral` and `durable` hold in-memory
// implementations used by the harness and the tests.

pub mod durable;
pub mod ephemeral;

use crate::document::{Document, Fields};
use crate::error::ChatPresenceError;
use crate::record::{PresenceRecord, PresenceWrite};
use async_trait::async_trait;
use futures::stream::Stream;
use std::pin::Pin;

pub use durable::InMemoryDurableStore;
pub use ephemeral::InMemoryEphemeralStore;

/// One applied write to an ephemeral key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralChange {
    pub key: String,
    pub before: Option<PresenceRecord>,
    pub after: PresenceRecord,
}

/// Item of a change subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Change(EphemeralChange),
    /// The subscriber fell behind; this many changes were dropped unseen
    Lagged(u64),
}

pub type ChangeStream = Pin<Box<dyn Stream<Item = ChangeEvent> + Send>>;
pub type ConnectivityStream = Pin<Box<dyn Stream<Item = bool> + Send>>;

/// Low-latency connection store (last known state per user)
#[async_trait]
pub trait EphemeralStore: Send + Sync {
    /// Current value at `key`
    async fn read(&self, key: &str) -> Result<Option<PresenceRecord>, ChatPresenceError>;

    /// Overwrite `key`, resolving server timestamps on arrival
    async fn write(&self, key: &str, value: PresenceWrite) -> Result<(), ChatPresenceError>;

    /// Arm a write the store applies by itself when this client's connection drops
    async fn on_disconnect_register(
        &self,
        key: &str,
        value: PresenceWrite,
    ) -> Result<(), ChatPresenceError>;

    /// Every applied write, in apply order
    fn on_change(&self) -> ChangeStream;

    /// Client connectivity; yields the current value first
    fn connectivity(&self) -> ConnectivityStream;
}

/// Read side of the durable document store
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// `Ok(None)` when no document exists at `path`
    async fn fetch(&self, path: &str) -> Result<Option<Document>, ChatPresenceError>;
}

/// Durable document store
#[async_trait]
pub trait DurableStore: DocumentSource {
    /// Replace the given top-level fields, leaving the rest of the document untouched.
    /// All-or-nothing.
    async fn merge_write(&self, path: &str, fields: Fields) -> Result<(), ChatPresenceError>;
}
