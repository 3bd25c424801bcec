// Presence Session Management
//
// Each active session owns one running connection watcher. Ending the session
// tears the watcher down.

use crate::watcher::ConnectionWatcher;
use chatpresence_core::{ChatPresenceError, DurableStore, EphemeralStore, PresencePaths};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Active presence session
#[derive(Debug, Clone)]
pub struct PresenceSession {
    /// Session ID
    pub id: String,

    /// Authenticated user the watcher publishes presence for
    pub user_id: String,

    /// Session start timestamp
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl PresenceSession {
    pub fn new(user_id: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            started_at: chrono::Utc::now(),
        }
    }
}

struct ActiveSession {
    session: PresenceSession,
    watcher: JoinHandle<()>,
}

/// Presence session manager
pub struct SessionManager {
    ephemeral: Arc<dyn EphemeralStore>,
    durable: Arc<dyn DurableStore>,
    paths: PresencePaths,
    sessions: Arc<RwLock<HashMap<String, ActiveSession>>>,
}

impl SessionManager {
    pub fn new(
        ephemeral: Arc<dyn EphemeralStore>,
        durable: Arc<dyn DurableStore>,
        paths: PresencePaths,
    ) -> Self {
        Self {
            ephemeral,
            durable,
            paths,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start a watcher for `user_id` and register it under a new session.
    pub async fn start_session(&self, user_id: &str) -> Result<PresenceSession, ChatPresenceError> {
        let watcher = ConnectionWatcher::new(
            user_id,
            self.ephemeral.clone(),
            self.durable.clone(),
            self.paths.clone(),
        )?;
        let session = PresenceSession::new(user_id.to_string());
        let mut sessions = self.sessions.write().await;
        sessions.insert(
            session.id.clone(),
            ActiveSession {
                session: session.clone(),
                watcher: watcher.spawn(),
            },
        );
        tracing::info!("Presence session {} started for user {}", session.id, user_id);
        Ok(session)
    }

    pub async fn get_session(&self, id: &str) -> Option<PresenceSession> {
        let sessions = self.sessions.read().await;
        sessions.get(id).map(|active| active.session.clone())
    }

    /// Stop the session's watcher. Returns false for an unknown id.
    pub async fn end_session(&self, id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.remove(id) {
            Some(active) => {
                active.watcher.abort();
                tracing::info!(
                    "Presence session {} ended for user {}",
                    id,
                    active.session.user_id
                );
                true
            }
            None => false,
        }
    }

    pub async fn end_all(&self) {
        let mut sessions = self.sessions.write().await;
        for (_, active) in sessions.drain() {
            active.watcher.abort();
        }
    }

    pub async fn list_sessions(&self) -> Vec<PresenceSession> {
        let sessions = self.sessions.read().await;
        sessions.values().map(|active| active.session.clone()).collect()
    }

    pub async fn count(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.len()
    }
}
