//! Key-value persistence for room documents.
//!
//! Architecture:
//! ```text
//! ┌────────────────────────┐   get / set / expire   ┌──────────────────────┐
//! │ VersionedDocumentStore │ ─────────────────────► │ PersistenceGateway   │
//! │ (version arbitration)  │                        │  ├─ MemoryGateway    │
//! └────────────────────────┘                        │  ├─ RocksGateway     │
//!                                                   │  └─ DisabledGateway  │
//!                                                   └──────────────────────┘
//! ```
//!
//! Key layout, all with a 24h expiry refreshed on every write:
//! - `room:<id>:code`: document body
//! - `room:<id>:version`: stringified version counter
//! - `room:<id>:language`: language tag

use async_trait::async_trait;
use std::time::Duration;

pub mod memory;
pub mod rocks;

pub use memory::MemoryGateway;
pub use rocks::{RocksConfig, RocksGateway};

/// Prefix shared by every room key.
pub const ROOM_KEY_PREFIX: &str = "room:";

/// Storage errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The backend cannot be reached or is switched off.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Async key-value store with per-key expiry.
///
/// Semantics follow a Redis-style string store: `set` clears any previous
/// expiry, `expire` only applies to keys that exist, expired keys read as
/// absent.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Returns `false` when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Returns `true` when a live key was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Live keys starting with `prefix`, in lexical order.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;
}

/// Gateway used when persistence is switched off: every call fails, which
/// keeps rooms running in relay-only mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledGateway;

#[async_trait]
impl PersistenceGateway for DisabledGateway {
    async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Err(StoreError::Unavailable("persistence disabled".into()))
    }

    async fn set(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("persistence disabled".into()))
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("persistence disabled".into()))
    }

    async fn delete(&self, _key: &str) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("persistence disabled".into()))
    }

    async fn keys_with_prefix(&self, _prefix: &str) -> Result<Vec<String>, StoreError> {
        Err(StoreError::Unavailable("persistence disabled".into()))
    }

    fn backend_name(&self) -> &'static str {
        "disabled"
    }
}

/// Key names for one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomKeys {
    pub code: String,
    pub version: String,
    pub language: String,
}

impl RoomKeys {
    pub fn new(room_id: &str) -> Self {
        Self {
            code: format!("{ROOM_KEY_PREFIX}{room_id}:code"),
            version: format!("{ROOM_KEY_PREFIX}{room_id}:version"),
            language: format!("{ROOM_KEY_PREFIX}{room_id}:language"),
        }
    }

    /// Extract the room id from a `room:<id>:code` key.
    pub fn room_of_code_key(key: &str) -> Option<&str> {
        key.strip_prefix(ROOM_KEY_PREFIX)?.strip_suffix(":code")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_keys_layout() {
        let keys = RoomKeys::new("abc-123");
        assert_eq!(keys.code, "room:abc-123:code");
        assert_eq!(keys.version, "room:abc-123:version");
        assert_eq!(keys.language, "room:abc-123:language");
    }

    #[test]
    fn test_room_of_code_key() {
        assert_eq!(RoomKeys::room_of_code_key("room:abc:code"), Some("abc"));
        assert_eq!(RoomKeys::room_of_code_key("room:a:b:code"), Some("a:b"));
        assert_eq!(RoomKeys::room_of_code_key("room:abc:version"), None);
        assert_eq!(RoomKeys::room_of_code_key("other:abc:code"), None);
    }

    #[tokio::test]
    async fn test_disabled_gateway_always_unavailable() {
        let gateway = DisabledGateway;
        assert!(matches!(gateway.get("k").await, Err(StoreError::Unavailable(_))));
        assert!(matches!(gateway.set("k", "v").await, Err(StoreError::Unavailable(_))));
        assert!(gateway.expire("k", Duration::from_secs(1)).await.is_err());
        assert_eq!(gateway.backend_name(), "disabled");
    }
}
