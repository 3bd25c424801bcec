//! chatpresence error types
//!
//! This module defines a layered error hierarchy:
//! - `DomainError`: presence and document rule violations (config, timestamps, paths)
//! - `InfraError`: store and IO failures (unavailable store, serialization)
//! - `ChatPresenceError`: top-level error that wraps both categories

use std::fmt;

/// Domain-level errors representing presence/document rule violations
#[derive(Debug)]
pub enum DomainError {
    /// Configuration file not found at the specified path
    ConfigNotFound { path: String },
    /// Configuration validation failed
    ConfigInvalid { field: String, reason: String },
    /// Configuration parsing failed
    ConfigParse { source: String },
    /// Epoch milliseconds outside the representable range
    InvalidTimestamp { millis: i64 },
    /// Store key or document path is malformed
    InvalidPath { path: String, reason: String },
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigNotFound { path } => write!(f, "Config not found: {}", path),
            Self::ConfigInvalid { field, reason } => {
                write!(f, "Config invalid [{}]: {}", field, reason)
            }
            Self::ConfigParse { source } => write!(f, "Config parse error: {}", source),
            Self::InvalidTimestamp { millis } => {
                write!(f, "Timestamp out of range: {} ms since epoch", millis)
            }
            Self::InvalidPath { path, reason } => write!(f, "Invalid path '{}': {}", path, reason),
        }
    }
}

impl std::error::Error for DomainError {}

/// Infrastructure-level errors representing external store failures
#[derive(Debug)]
pub enum InfraError {
    /// IO operation failed
    Io(std::io::Error),
    /// JSON serialization/deserialization failed
    Json(serde_json::Error),
    /// YAML serialization/deserialization failed
    Yaml(serde_yml::Error),
    /// Store cannot be reached (e.g. the client connection is down)
    StoreUnavailable { store: String, key: String },
    /// Store rejected or failed the operation
    Store { store: String, reason: String },
}

impl fmt::Display for InfraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "IO error: {}", err),
            Self::Json(err) => write!(f, "JSON error: {}", err),
            Self::Yaml(err) => write!(f, "YAML error: {}", err),
            Self::StoreUnavailable { store, key } => {
                write!(f, "{} store unavailable for '{}'", store, key)
            }
            Self::Store { store, reason } => write!(f, "{} store error: {}", store, reason),
        }
    }
}

impl std::error::Error for InfraError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Json(e) => Some(e),
            Self::Yaml(e) => Some(e),
            Self::StoreUnavailable { .. } | Self::Store { .. } => None,
        }
    }
}

impl From<std::io::Error> for InfraError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for InfraError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}

impl From<serde_yml::Error> for InfraError {
    fn from(err: serde_yml::Error) -> Self {
        Self::Yaml(err)
    }
}

/// Top-level error type for chatpresence
///
/// Wraps both domain and infrastructure errors so callers can still match on
/// the category (e.g. retry only infrastructure failures).
#[derive(Debug)]
pub enum ChatPresenceError {
    /// Presence/document rule violation
    Domain(DomainError),
    /// Infrastructure/external store error
    Infra(InfraError),
    /// Generic error for edge cases
    Other(String),
}

impl fmt::Display for ChatPresenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Domain(e) => write!(f, "{}", e),
            Self::Infra(e) => write!(f, "{}", e),
            Self::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for ChatPresenceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Domain(e) => Some(e),
            Self::Infra(e) => Some(e),
            Self::Other(_) => None,
        }
    }
}

impl From<DomainError> for ChatPresenceError {
    fn from(err: DomainError) -> Self {
        Self::Domain(err)
    }
}

impl From<InfraError> for ChatPresenceError {
    fn from(err: InfraError) -> Self {
        Self::Infra(err)
    }
}

// Convenience conversions from infrastructure error sources
impl From<std::io::Error> for ChatPresenceError {
    fn from(err: std::io::Error) -> Self {
        Self::Infra(InfraError::Io(err))
    }
}

impl From<serde_json::Error> for ChatPresenceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Infra(InfraError::Json(err))
    }
}

impl From<serde_yml::Error> for ChatPresenceError {
    fn from(err: serde_yml::Error) -> Self {
        Self::Infra(InfraError::Yaml(err))
    }
}

impl ChatPresenceError {
    pub fn config_not_found(path: impl Into<String>) -> Self {
        Self::Domain(DomainError::ConfigNotFound { path: path.into() })
    }

    pub fn config_parse_error(source: impl Into<String>) -> Self {
        Self::Domain(DomainError::ConfigParse {
            source: source.into(),
        })
    }

    pub fn config_invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Domain(DomainError::ConfigInvalid {
            field: field.into(),
            reason: reason.into(),
        })
    }

    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Domain(DomainError::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        })
    }

    pub fn store_unavailable(store: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Infra(InfraError::StoreUnavailable {
            store: store.into(),
            key: key.into(),
        })
    }

    pub fn store_error(store: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Infra(InfraError::Store {
            store: store.into(),
            reason: reason.into(),
        })
    }

    /// Whether a retry of the same operation could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Infra(InfraError::StoreUnavailable { .. } | InfraError::Store { .. })
        )
    }
}
