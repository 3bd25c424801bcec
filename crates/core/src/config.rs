//! chatpresence configuration
//!
//! Configuration structures with serde defaults, a loader that resolves the
//! file location, and a validator for values serde cannot reject on its own.

use crate::error::ChatPresenceError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ============================================================================
// Constants
// ============================================================================

/// Ephemeral key prefix for presence records
pub const DEFAULT_STATUS_ROOT: &str = "status";
/// Durable collection holding user profiles
pub const DEFAULT_USERS_COLLECTION: &str = "users";
/// Delivery attempts per change event before it is reported failed
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Pause between delivery attempts (milliseconds)
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 200;
/// Queued change events per user lane
pub const DEFAULT_LANE_CAPACITY: usize = 64;
/// Idle time after which a user lane is shut down (milliseconds)
pub const DEFAULT_LANE_IDLE_MS: u64 = 30_000;
/// Default tracing filter
pub const DEFAULT_LOG_FILTER: &str = "chatpresence=info,warn";

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

// ============================================================================
// Main Config
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Store layout for presence records
    #[serde(default)]
    pub presence: PresenceConfig,
    /// Change delivery policy
    #[serde(default)]
    pub trigger: TriggerConfig,
    /// Document cache configuration
    #[serde(default)]
    pub cache: CacheConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ============================================================================
// Presence Config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Ephemeral key prefix, records live at `{status_root}/{userId}`
    #[serde(default = "PresenceConfig::default_status_root")]
    pub status_root: String,
    /// Durable profiles live at `{users_collection}/{userId}`
    #[serde(default = "PresenceConfig::default_users_collection")]
    pub users_collection: String,
}

impl PresenceConfig {
    fn default_status_root() -> String {
        DEFAULT_STATUS_ROOT.to_string()
    }
    fn default_users_collection() -> String {
        DEFAULT_USERS_COLLECTION.to_string()
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            status_root: DEFAULT_STATUS_ROOT.to_string(),
            users_collection: DEFAULT_USERS_COLLECTION.to_string(),
        }
    }
}

// ============================================================================
// Trigger Config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Attempts per change event, including the first
    #[serde(default = "TriggerConfig::default_max_attempts")]
    pub max_attempts: u32,
    /// Pause between attempts in milliseconds
    #[serde(default = "TriggerConfig::default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Queued changes per user; beyond it the newest queued change is replaced
    #[serde(default = "TriggerConfig::default_lane_capacity")]
    pub lane_capacity: usize,
    /// A user's lane is torn down after this long without work
    #[serde(default = "TriggerConfig::default_lane_idle_ms")]
    pub lane_idle_ms: u64,
}

impl TriggerConfig {
    fn default_max_attempts() -> u32 {
        DEFAULT_MAX_ATTEMPTS
    }
    fn default_retry_backoff_ms() -> u64 {
        DEFAULT_RETRY_BACKOFF_MS
    }
    fn default_lane_capacity() -> usize {
        DEFAULT_LANE_CAPACITY
    }
    fn default_lane_idle_ms() -> u64 {
        DEFAULT_LANE_IDLE_MS
    }

    pub fn retry_backoff(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn lane_idle(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.lane_idle_ms)
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            lane_capacity: DEFAULT_LANE_CAPACITY,
            lane_idle_ms: DEFAULT_LANE_IDLE_MS,
        }
    }
}

// ============================================================================
// Cache Config
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Upper bound on resolved documents; unbounded when absent
    #[serde(default)]
    pub max_entries: Option<usize>,
}

// ============================================================================
// Logging Config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    #[serde(default = "LoggingConfig::default_filter")]
    pub filter: String,
}

impl LoggingConfig {
    fn default_filter() -> String {
        DEFAULT_LOG_FILTER.to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

// ============================================================================
// Config Loading and Validation
// ============================================================================

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load from an explicit path, or the first default location that exists.
    ///
    /// An explicit path must exist. Without one, a missing file yields the
    /// defaults.
    pub fn load(path: Option<&str>) -> Result<Config, ChatPresenceError> {
        let config = match path {
            Some(p) => {
                let p = PathBuf::from(p);
                if !p.exists() {
                    return Err(ChatPresenceError::config_not_found(p.display().to_string()));
                }
                Self::load_file(&p)?
            }
            None => match Self::default_paths().into_iter().find(|p| p.exists()) {
                Some(p) => Self::load_file(&p)?,
                None => {
                    tracing::debug!("No config file found, using defaults");
                    Config::default()
                }
            },
        };
        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    fn load_file(path: &Path) -> Result<Config, ChatPresenceError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ChatPresenceError::config_parse_error(format!("Failed to read: {}", e)))?;
        let config: Config = serde_yml::from_str(&content)
            .map_err(|e| ChatPresenceError::config_parse_error(format!("Failed to parse: {}", e)))?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn default_paths() -> [PathBuf; 3] {
        [
            home_dir().join(".chatpresence/config.yaml"),
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("chatpresence.yaml"),
            PathBuf::from("./chatpresence.yaml"),
        ]
    }
}

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &Config) -> Result<(), ChatPresenceError> {
        Self::validate_segment("presence.status_root", &config.presence.status_root)?;
        Self::validate_segment(
            "presence.users_collection",
            &config.presence.users_collection,
        )?;

        if config.trigger.max_attempts == 0 {
            return Err(ChatPresenceError::config_invalid(
                "trigger.max_attempts",
                "At least one delivery attempt is required",
            ));
        }
        if config.trigger.lane_capacity == 0 {
            return Err(ChatPresenceError::config_invalid(
                "trigger.lane_capacity",
                "Lane capacity must be positive",
            ));
        }
        if config.trigger.lane_idle_ms == 0 {
            return Err(ChatPresenceError::config_invalid(
                "trigger.lane_idle_ms",
                "Lanes need a positive idle timeout",
            ));
        }
        if config.cache.max_entries == Some(0) {
            return Err(ChatPresenceError::config_invalid(
                "cache.max_entries",
                "Use null for an unbounded cache; 0 would cache nothing",
            ));
        }

        Ok(())
    }

    fn validate_segment(field: &str, value: &str) -> Result<(), ChatPresenceError> {
        if value.trim().is_empty() {
            return Err(ChatPresenceError::config_invalid(field, "Cannot be empty"));
        }
        if value.contains('/') {
            return Err(ChatPresenceError::config_invalid(
                field,
                format!("'{}' must be a single path segment", value),
            ));
        }
        Ok(())
    }
}

impl Config {
    pub fn load(path: &Option<String>) -> Result<Self, ChatPresenceError> {
        ConfigLoader::load(path.as_deref())
    }

    pub fn save(&self, path: &Path) -> Result<(), ChatPresenceError> {
        let content = serde_yml::to_string(self).map_err(|e| {
            ChatPresenceError::config_parse_error(format!("Serialization failed: {}", e))
        })?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Sample configuration written by `config-sample`
    pub fn sample() -> Self {
        Config {
            presence: PresenceConfig::default(),
            trigger: TriggerConfig::default(),
            cache: CacheConfig {
                max_entries: Some(10_000),
            },
            logging: LoggingConfig::default(),
        }
    }
}
