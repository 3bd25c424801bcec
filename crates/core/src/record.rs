//! Presence records as they live in the ephemeral and durable stores.
//!
//! The ephemeral store keeps `lastChanged` as epoch milliseconds, the durable
//! store as a native timestamp. `EpochMillis::to_datetime` is the only place
//! the two representations meet.

use crate::config::PresenceConfig;
use crate::document::Fields;
use crate::error::{ChatPresenceError, DomainError};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection state of a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceState {
    Online,
    Offline,
}

impl fmt::Display for PresenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Milliseconds since the Unix epoch, as assigned by the ephemeral store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EpochMillis(pub i64);

impl EpochMillis {
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }

    /// Convert into the durable store's timestamp representation.
    pub fn to_datetime(self) -> Result<DateTime<Utc>, DomainError> {
        Utc.timestamp_millis_opt(self.0)
            .single()
            .ok_or(DomainError::InvalidTimestamp { millis: self.0 })
    }
}

impl From<i64> for EpochMillis {
    fn from(millis: i64) -> Self {
        Self(millis)
    }
}

impl fmt::Display for EpochMillis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// A timestamp that is either explicit or filled in by the store on apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStamp<T> {
    /// Placeholder resolved to the store's clock when the write lands
    Server,
    At(T),
}

impl<T> ServerStamp<T> {
    pub fn resolve(self, now: impl FnOnce() -> T) -> T {
        match self {
            Self::Server => now(),
            Self::At(value) => value,
        }
    }
}

/// Presence value stored in the ephemeral store under `status/{userId}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub state: PresenceState,
    pub last_changed: EpochMillis,
}

impl PresenceRecord {
    pub fn new(state: PresenceState, last_changed: impl Into<EpochMillis>) -> Self {
        Self {
            state,
            last_changed: last_changed.into(),
        }
    }
}

/// A client-side write to the ephemeral store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceWrite {
    pub state: PresenceState,
    pub last_changed: ServerStamp<EpochMillis>,
}

impl PresenceWrite {
    pub fn online() -> Self {
        Self {
            state: PresenceState::Online,
            last_changed: ServerStamp::Server,
        }
    }

    pub fn offline() -> Self {
        Self {
            state: PresenceState::Offline,
            last_changed: ServerStamp::Server,
        }
    }

    pub fn at(state: PresenceState, last_changed: impl Into<EpochMillis>) -> Self {
        Self {
            state,
            last_changed: ServerStamp::At(last_changed.into()),
        }
    }

    pub fn resolve(self, now: impl FnOnce() -> EpochMillis) -> PresenceRecord {
        PresenceRecord {
            state: self.state,
            last_changed: self.last_changed.resolve(now),
        }
    }
}

/// Trigger payload for one write to a user's ephemeral presence record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceChange {
    pub user_id: String,
    pub before: Option<PresenceRecord>,
    pub after: PresenceRecord,
}

/// Presence as stored in the durable user profile (`users/{userId}.status`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurableStatus {
    pub state: PresenceState,
    pub last_changed: DateTime<Utc>,
}

impl DurableStatus {
    pub const FIELD: &'static str = "status";

    pub fn from_record(record: &PresenceRecord) -> Result<Self, DomainError> {
        Ok(Self {
            state: record.state,
            last_changed: record.last_changed.to_datetime()?,
        })
    }

    /// Read the nested status back out of a profile document's fields.
    pub fn from_fields(fields: &Fields) -> Option<Self> {
        fields
            .get(Self::FIELD)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }
}

/// Key and document layout shared by the watcher, dispatcher and reconciler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresencePaths {
    status_root: String,
    users_collection: String,
}

impl PresencePaths {
    pub fn new(status_root: impl Into<String>, users_collection: impl Into<String>) -> Self {
        Self {
            status_root: status_root.into(),
            users_collection: users_collection.into(),
        }
    }

    pub fn from_config(config: &PresenceConfig) -> Self {
        Self::new(&config.status_root, &config.users_collection)
    }

    /// Ephemeral key for a user, e.g. `status/42`
    pub fn status_key(&self, user_id: &str) -> String {
        format!("{}/{}", self.status_root, user_id)
    }

    /// Durable profile document path for a user, e.g. `users/42`
    pub fn user_document(&self, user_id: &str) -> String {
        format!("{}/{}", self.users_collection, user_id)
    }

    /// Match `{status_root}/{userId}` and return the user id.
    pub fn user_id_for(&self, key: &str) -> Option<String> {
        let user_id = key
            .strip_prefix(self.status_root.as_str())?
            .strip_prefix('/')?;
        if user_id.is_empty() || user_id.contains('/') {
            return None;
        }
        Some(user_id.to_string())
    }

    pub fn validate_user_id(user_id: &str) -> Result<(), ChatPresenceError> {
        if user_id.trim().is_empty() {
            return Err(ChatPresenceError::invalid_path(user_id, "user id cannot be empty"));
        }
        if user_id.contains('/') {
            return Err(ChatPresenceError::invalid_path(
                user_id,
                "user id cannot contain path separators",
            ));
        }
        Ok(())
    }
}

impl Default for PresencePaths {
    fn default() -> Self {
        Self::from_config(&PresenceConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_millis_conversion() {
        let at = EpochMillis(1_700_000_000_123).to_datetime().unwrap();
        assert_eq!(at.timestamp_millis(), 1_700_000_000_123);

        let err = EpochMillis(i64::MAX).to_datetime().unwrap_err();
        assert!(matches!(err, DomainError::InvalidTimestamp { millis } if millis == i64::MAX));
    }

    #[test]
    fn test_record_wire_format() {
        let record = PresenceRecord::new(PresenceState::Online, 42);
        let value = serde_json::to_value(record).unwrap();
        assert_eq!(value, serde_json::json!({ "state": "online", "lastChanged": 42 }));
    }

    #[test]
    fn test_server_stamp_resolution() {
        let record = PresenceWrite::online().resolve(|| EpochMillis(7));
        assert_eq!(record, PresenceRecord::new(PresenceState::Online, 7));

        let record = PresenceWrite::at(PresenceState::Offline, 3).resolve(|| EpochMillis(7));
        assert_eq!(record.last_changed, EpochMillis(3));
    }

    #[test]
    fn test_paths() {
        let paths = PresencePaths::default();
        assert_eq!(paths.status_key("42"), "status/42");
        assert_eq!(paths.user_document("42"), "users/42");
        assert_eq!(paths.user_id_for("status/42"), Some("42".to_string()));
        assert_eq!(paths.user_id_for("status/"), None);
        assert_eq!(paths.user_id_for("status/a/b"), None);
        assert_eq!(paths.user_id_for("statuses/42"), None);
        assert!(PresencePaths::validate_user_id("a/b").is_err());
    }

    #[test]
    fn test_durable_status_from_fields() {
        let status = DurableStatus::from_record(&PresenceRecord::new(PresenceState::Offline, 1_000))
            .unwrap();
        let mut fields = Fields::new();
        fields.insert(
            DurableStatus::FIELD.to_string(),
            serde_json::to_value(&status).unwrap(),
        );
        assert_eq!(DurableStatus::from_fields(&fields), Some(status));
        assert_eq!(DurableStatus::from_fields(&Fields::new()), None);
    }
}
