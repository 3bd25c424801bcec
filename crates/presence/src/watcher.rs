// Connection Watcher
//
// Client-side half of presence: follows the connectivity signal, arms the
// disconnect fallback and publishes "online" to both stores.

use chatpresence_core::document::{self, Fields};
use chatpresence_core::{
    ChatPresenceError, DurableStatus, DurableStore, EphemeralStore, PresencePaths, PresenceState,
    PresenceWrite,
};
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unknown,
    Online,
    Offline,
}

pub struct ConnectionWatcher {
    user_id: String,
    ephemeral: Arc<dyn EphemeralStore>,
    durable: Arc<dyn DurableStore>,
    paths: PresencePaths,
    state: ConnectionState,
}

impl ConnectionWatcher {
    pub fn new(
        user_id: impl Into<String>,
        ephemeral: Arc<dyn EphemeralStore>,
        durable: Arc<dyn DurableStore>,
        paths: PresencePaths,
    ) -> Result<Self, ChatPresenceError> {
        let user_id = user_id.into();
        PresencePaths::validate_user_id(&user_id)?;
        Ok(Self {
            user_id,
            ephemeral,
            durable,
            paths,
            state: ConnectionState::Unknown,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Apply one connectivity signal and return the resulting state.
    pub async fn on_connectivity(&mut self, connected: bool) -> ConnectionState {
        match (self.state, connected) {
            (ConnectionState::Online, true) | (ConnectionState::Offline, false) => {
                tracing::debug!(user_id = %self.user_id, "Repeated connectivity signal ignored");
            }
            (_, false) => {
                self.state = ConnectionState::Offline;
                self.go_offline().await;
            }
            (_, true) => {
                self.state = ConnectionState::Online;
                self.go_online().await;
            }
        }
        self.state
    }

    /// Follow the connectivity signal until it ends.
    pub async fn run(mut self) {
        let mut signals = self.ephemeral.connectivity();
        tracing::info!(user_id = %self.user_id, "Connection watcher started");
        while let Some(connected) = signals.next().await {
            self.on_connectivity(connected).await;
        }
        tracing::info!(user_id = %self.user_id, "Connection watcher stopped");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    // Not connected, so there is nothing to arm; tell the durable store directly.
    async fn go_offline(&self) {
        let document = self.paths.user_document(&self.user_id);
        if let Err(e) = self
            .durable
            .merge_write(&document, status_fields(PresenceState::Offline))
            .await
        {
            tracing::warn!(user_id = %self.user_id, "Offline status write failed: {}", e);
        }
        tracing::info!(user_id = %self.user_id, "Marked offline");
    }

    // Order matters: the fallback must be armed before "online" is visible.
    async fn go_online(&self) {
        let key = self.paths.status_key(&self.user_id);

        if let Err(e) = self
            .ephemeral
            .on_disconnect_register(&key, PresenceWrite::offline())
            .await
        {
            tracing::warn!(
                user_id = %self.user_id,
                "Disconnect handler registration failed, not marking online: {}",
                e
            );
            return;
        }

        if let Err(e) = self.ephemeral.write(&key, PresenceWrite::online()).await {
            tracing::warn!(user_id = %self.user_id, "Online ephemeral write failed: {}", e);
        }

        let document = self.paths.user_document(&self.user_id);
        if let Err(e) = self
            .durable
            .merge_write(&document, status_fields(PresenceState::Online))
            .await
        {
            tracing::warn!(user_id = %self.user_id, "Online status write failed: {}", e);
        }
        tracing::info!(user_id = %self.user_id, "Marked online");
    }
}

/// `{status: {state, lastChanged: <server timestamp>}}`
fn status_fields(state: PresenceState) -> Fields {
    let mut fields = Fields::new();
    fields.insert(
        DurableStatus::FIELD.to_string(),
        json!({
            "state": state,
            "lastChanged": document::server_timestamp(),
        }),
    );
    fields
}
