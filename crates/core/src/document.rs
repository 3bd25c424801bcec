//! Durable store documents and the server timestamp sentinel.

use crate::error::ChatPresenceError;
use serde_json::{json, Value as JsonValue};

/// Field mapping of a durable document
pub type Fields = serde_json::Map<String, JsonValue>;

const SERVER_VALUE_KEY: &str = ".sv";
const SERVER_VALUE_TIMESTAMP: &str = "timestamp";

/// Sentinel replaced by the durable store's clock when a write is applied
pub fn server_timestamp() -> JsonValue {
    json!({ SERVER_VALUE_KEY: SERVER_VALUE_TIMESTAMP })
}

pub fn is_server_timestamp(value: &JsonValue) -> bool {
    match value {
        JsonValue::Object(map) => {
            map.len() == 1
                && map.get(SERVER_VALUE_KEY).and_then(JsonValue::as_str)
                    == Some(SERVER_VALUE_TIMESTAMP)
        }
        _ => false,
    }
}

/// Replace every server timestamp sentinel nested in `value` with `now`.
pub fn resolve_server_timestamps(value: &mut JsonValue, now: &JsonValue) {
    if is_server_timestamp(value) {
        *value = now.clone();
        return;
    }
    match value {
        JsonValue::Object(map) => {
            for nested in map.values_mut() {
                resolve_server_timestamps(nested, now);
            }
        }
        JsonValue::Array(items) => {
            for nested in items.iter_mut() {
                resolve_server_timestamps(nested, now);
            }
        }
        _ => {}
    }
}

/// A document snapshot as returned by the durable store
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }
}

/// Document paths alternate collection and document ids: `users/42`, `a/b/c/d`.
pub fn validate_document_path(path: &str) -> Result<(), ChatPresenceError> {
    if path.trim().is_empty() {
        return Err(ChatPresenceError::invalid_path(path, "path cannot be empty"));
    }
    let segments: Vec<&str> = path.split('/').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(ChatPresenceError::invalid_path(path, "path contains an empty segment"));
    }
    if segments.len() % 2 != 0 {
        return Err(ChatPresenceError::invalid_path(
            path,
            "path must point at a document, not a collection",
        ));
    }
    Ok(())
}

/// Last segment of a document path
pub fn document_id(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
