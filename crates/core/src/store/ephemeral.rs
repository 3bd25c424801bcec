// In-memory ephemeral store
//
// Models a realtime connection store as seen by one client: a server clock,
// per-connection disconnect handlers, change notifications and the
// connectivity signal. Writes fail while the client is disconnected.

use super::{ChangeEvent, ChangeStream, ConnectivityStream, EphemeralChange, EphemeralStore};
use crate::error::ChatPresenceError;
use crate::record::{EpochMillis, PresenceRecord, PresenceWrite};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use tokio::sync::{broadcast, Mutex as AsyncMutex, RwLock};
use uuid::Uuid;

const STORE_NAME: &str = "ephemeral";
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct Connection {
    /// Present while connected
    id: Option<Uuid>,
    /// Last value published on the connectivity channel
    signalled: bool,
    /// Disconnect handlers armed on the current connection
    on_disconnect: HashMap<String, PresenceWrite>,
}

pub struct InMemoryEphemeralStore {
    records: RwLock<HashMap<String, PresenceRecord>>,
    connection: Mutex<Connection>,
    /// Serializes `set_connected` so signals go out in transition order
    transition: AsyncMutex<()>,
    /// Last timestamp handed out, so server time never repeats or goes back
    clock: AtomicI64,
    changes_tx: broadcast::Sender<EphemeralChange>,
    connectivity_tx: broadcast::Sender<bool>,
}

impl InMemoryEphemeralStore {
    /// A store whose client starts disconnected
    pub fn new() -> Self {
        let (changes_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (connectivity_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            records: RwLock::new(HashMap::new()),
            connection: Mutex::new(Connection::default()),
            transition: AsyncMutex::new(()),
            clock: AtomicI64::new(0),
            changes_tx,
            connectivity_tx,
        }
    }

    /// Strictly increasing server time in epoch milliseconds
    pub fn server_now(&self) -> EpochMillis {
        let wall = EpochMillis::now().as_i64();
        let previous = self
            .clock
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(wall.max(last + 1))
            })
            .unwrap_or(wall);
        EpochMillis(wall.max(previous + 1))
    }

    pub fn is_connected(&self) -> bool {
        self.lock_connection().id.is_some()
    }

    /// Keys with an armed disconnect handler on the current connection
    pub fn armed_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock_connection().on_disconnect.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Simulate the client connection coming up or dropping.
    ///
    /// On a drop the armed handlers are applied by the "server" and discarded
    /// before `false` is published; they never survive into the next
    /// connection. Writes are refused from the moment the drop begins.
    pub async fn set_connected(&self, connected: bool) {
        let _transition = self.transition.lock().await;

        let fired = {
            let mut connection = self.lock_connection();
            if connection.id.is_some() == connected {
                return;
            }
            if connected {
                let id = Uuid::new_v4();
                tracing::debug!("Ephemeral connection {} established", id);
                connection.id = Some(id);
                self.publish_connectivity(&mut connection, true);
                return;
            }
            if let Some(id) = connection.id.take() {
                tracing::debug!("Ephemeral connection {} dropped", id);
            }
            std::mem::take(&mut connection.on_disconnect)
        };

        for (key, value) in fired {
            tracing::debug!("Applying disconnect handler for {}", key);
            self.apply(&key, value).await;
        }

        let mut connection = self.lock_connection();
        self.publish_connectivity(&mut connection, false);
    }

    /// Write issued by the server itself (no client connection needed)
    pub async fn apply(&self, key: &str, value: PresenceWrite) -> PresenceRecord {
        let mut records = self.records.write().await;
        // Stamped under the lock so commit order and timestamp order agree
        let after = value.resolve(|| self.server_now());
        let before = records.insert(key.to_string(), after);
        // Sent while holding the write lock so notification order matches apply order
        let _ = self.changes_tx.send(EphemeralChange {
            key: key.to_string(),
            before,
            after,
        });
        after
    }

    // Under the connection lock so `connectivity()` never misses or duplicates a signal
    fn publish_connectivity(&self, connection: &mut Connection, connected: bool) {
        connection.signalled = connected;
        let _ = self.connectivity_tx.send(connected);
    }

    fn ensure_connected(&self, key: &str) -> Result<(), ChatPresenceError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ChatPresenceError::store_unavailable(STORE_NAME, key))
        }
    }

    fn lock_connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for InMemoryEphemeralStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EphemeralStore for InMemoryEphemeralStore {
    async fn read(&self, key: &str) -> Result<Option<PresenceRecord>, ChatPresenceError> {
        let records = self.records.read().await;
        Ok(records.get(key).copied())
    }

    async fn write(&self, key: &str, value: PresenceWrite) -> Result<(), ChatPresenceError> {
        self.ensure_connected(key)?;
        self.apply(key, value).await;
        Ok(())
    }

    async fn on_disconnect_register(
        &self,
        key: &str,
        value: PresenceWrite,
    ) -> Result<(), ChatPresenceError> {
        let mut connection = self.lock_connection();
        if connection.id.is_none() {
            return Err(ChatPresenceError::store_unavailable(STORE_NAME, key));
        }
        connection.on_disconnect.insert(key.to_string(), value);
        Ok(())
    }

    fn on_change(&self) -> ChangeStream {
        let mut rx = self.changes_tx.subscribe();
        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(change) => yield ChangeEvent::Change(change),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Change subscriber lagged, skipped {} changes", skipped);
                        yield ChangeEvent::Lagged(skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Box::pin(stream)
    }

    fn connectivity(&self) -> ConnectivityStream {
        let (current, mut rx) = {
            let connection = self.lock_connection();
            (connection.signalled, self.connectivity_tx.subscribe())
        };
        let stream = async_stream::stream! {
            yield current;
            loop {
                match rx.recv().await {
                    Ok(connected) => yield connected,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Connectivity subscriber lagged, skipped {} signals", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Box::pin(stream)
    }
}
