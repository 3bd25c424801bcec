pub mod config;
pub mod document;
pub mod error;
pub mod record;
pub mod store;

// Re-export commonly used types
pub use config::{CacheConfig, Config, ConfigLoader, ConfigValidator, PresenceConfig, TriggerConfig};
pub use document::{Document, Fields};
pub use error::{ChatPresenceError, DomainError, InfraError};
pub use record::{
    DurableStatus, EpochMillis, PresenceChange, PresencePaths, PresenceRecord, PresenceState,
    PresenceWrite, ServerStamp,
};
pub use store::{
    ChangeEvent, DocumentSource, DurableStore, EphemeralChange, EphemeralStore,
    InMemoryDurableStore, InMemoryEphemeralStore,
};
