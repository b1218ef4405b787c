//! Versioned document store.
//!
//! Owns the in-memory version counter of every room and brokers reads and
//! writes of the persisted body. The counter only moves when the stored body
//! actually changes.
//!
//! Storage failures never reach callers: reads degrade to the placeholder
//! body at version 0 and writes report [`WriteOutcome::Unavailable`].
//!
//! Writes are read-compare-write against the gateway. With
//! [`WriteOrdering::Racy`] (the default) two writers racing on one room may
//! both bump from the same prior version and the last one to persist wins.
//! [`WriteOrdering::Serialized`] takes a per-room lock around the sequence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

use crate::protocol::RoomId;
use crate::storage::{PersistenceGateway, RoomKeys, StoreError, ROOM_KEY_PREFIX};

/// Expiry applied to every persisted room key, refreshed on each write.
pub const DOCUMENT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Body served for rooms without an accepted document.
pub const PLACEHOLDER_BODY: &str = "// Write your code here";

/// How concurrent snapshot writes to one room are ordered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteOrdering {
    /// No room-level lock, last write wins.
    #[default]
    Racy,
    /// One write per room at a time.
    Serialized,
}

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub ttl: Duration,
    pub placeholder: String,
    pub write_ordering: WriteOrdering,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            ttl: DOCUMENT_TTL,
            placeholder: PLACEHOLDER_BODY.to_string(),
            write_ordering: WriteOrdering::Racy,
        }
    }
}

/// Result of [`VersionedDocumentStore::read`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSnapshot {
    pub body: String,
    pub version: u64,
    /// The gateway failed and the placeholder was served instead.
    pub degraded: bool,
}

/// Result of [`VersionedDocumentStore::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Body identical to the stored one; version untouched.
    Unchanged(u64),
    /// Body persisted under a new version.
    Updated(u64),
    /// The gateway failed; the write was dropped.
    Unavailable,
}

impl WriteOutcome {
    /// Version after the write, `None` when it was dropped.
    pub fn version(&self) -> Option<u64> {
        match self {
            Self::Unchanged(v) | Self::Updated(v) => Some(*v),
            Self::Unavailable => None,
        }
    }
}

/// Everything persisted for one room, for maintenance tooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRoom {
    pub room_id: RoomId,
    pub body: Option<String>,
    pub version: Option<u64>,
    pub language: Option<String>,
}

/// Room documents and their version counters.
pub struct VersionedDocumentStore {
    gateway: Arc<dyn PersistenceGateway>,
    versions: RwLock<HashMap<RoomId, u64>>,
    write_locks: Mutex<HashMap<RoomId, Arc<Mutex<()>>>>,
    options: StoreOptions,
}

impl VersionedDocumentStore {
    pub fn new(gateway: Arc<dyn PersistenceGateway>, options: StoreOptions) -> Self {
        Self {
            gateway,
            versions: RwLock::new(HashMap::new()),
            write_locks: Mutex::new(HashMap::new()),
            options,
        }
    }

    pub fn with_defaults(gateway: Arc<dyn PersistenceGateway>) -> Self {
        Self::new(gateway, StoreOptions::default())
    }

    pub fn placeholder(&self) -> &str {
        &self.options.placeholder
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn backend_name(&self) -> &'static str {
        self.gateway.backend_name()
    }

    /// Current in-memory version of a room, if the room is tracked.
    pub async fn current_version(&self, room: &str) -> Option<u64> {
        self.versions.read().await.get(room).copied()
    }

    /// Read the document a (re)joining session should see.
    ///
    /// `active_sessions` is the number of sessions already in the room. An
    /// empty room always starts over from the placeholder at version 0,
    /// whatever is left in storage.
    pub async fn read(&self, room: &str, active_sessions: usize) -> DocumentSnapshot {
        if active_sessions == 0 {
            self.versions.write().await.insert(room.to_string(), 0);
            log::debug!("Room {room} has no sessions, serving placeholder at v0");
            return self.placeholder_snapshot(false);
        }

        let tracked = self.current_version(room).await;
        if tracked == Some(0) {
            return self.placeholder_snapshot(false);
        }

        let keys = RoomKeys::new(room);
        let body = match self.gateway.get(&keys.code).await {
            Ok(body) => body,
            Err(e) => {
                log::warn!("Storage unavailable reading room {room}: {e}");
                return self.placeholder_snapshot(true);
            }
        };

        let version = match tracked {
            Some(v) => v,
            None => {
                let stored = match self.stored_version(&keys).await {
                    Ok(v) => v.unwrap_or(0),
                    Err(e) => {
                        log::warn!("Storage unavailable reading version of room {room}: {e}");
                        return self.placeholder_snapshot(true);
                    }
                };
                self.versions.write().await.entry(room.to_string()).or_insert(stored);
                stored
            }
        };

        DocumentSnapshot {
            body: body.unwrap_or_else(|| self.options.placeholder.clone()),
            version,
            degraded: false,
        }
    }

    /// Persist a new body for a room.
    ///
    /// Identical content leaves the version alone; changed content bumps it
    /// by one and refreshes the expiry of the body and version keys.
    pub async fn write(&self, room: &str, body: &str) -> WriteOutcome {
        match self.options.write_ordering {
            WriteOrdering::Racy => self.write_unordered(room, body).await,
            WriteOrdering::Serialized => {
                let lock = self.room_lock(room).await;
                let _guard = lock.lock().await;
                self.write_unordered(room, body).await
            }
        }
    }

    async fn write_unordered(&self, room: &str, body: &str) -> WriteOutcome {
        let keys = RoomKeys::new(room);
        let stored = match self.gateway.get(&keys.code).await {
            Ok(stored) => stored,
            Err(e) => {
                log::warn!("Storage unavailable, dropping write to room {room}: {e}");
                return WriteOutcome::Unavailable;
            }
        };

        let current = self.current_version(room).await.unwrap_or(0);
        let effective = if current == 0 {
            self.options.placeholder.as_str()
        } else {
            stored.as_deref().unwrap_or(self.options.placeholder.as_str())
        };
        if effective == body {
            return WriteOutcome::Unchanged(current);
        }

        let next = current + 1;
        let previous = (stored.as_deref(), (current > 0).then_some(current));
        if let Err(e) = self.persist(&keys, body, next, previous).await {
            log::warn!("Storage unavailable, dropping write to room {room}: {e}");
            return WriteOutcome::Unavailable;
        }

        let mut versions = self.versions.write().await;
        let entry = versions.entry(room.to_string()).or_insert(0);
        *entry = (*entry).max(next);
        log::debug!("Room {room} advanced to v{next} ({} bytes)", body.len());
        WriteOutcome::Updated(next)
    }

    /// Write a body and its version. If any step after the body lands
    /// fails, both keys are put back to `previous`.
    async fn persist(
        &self,
        keys: &RoomKeys,
        body: &str,
        version: u64,
        previous: (Option<&str>, Option<u64>),
    ) -> Result<(), StoreError> {
        let ttl = self.options.ttl;
        self.gateway.set(&keys.code, body).await?;
        let rest = async {
            self.gateway.expire(&keys.code, ttl).await?;
            self.gateway.set(&keys.version, &version.to_string()).await?;
            self.gateway.expire(&keys.version, ttl).await?;
            Ok::<_, StoreError>(())
        }
        .await;
        if let Err(e) = rest {
            self.restore(keys, previous).await;
            return Err(e);
        }
        Ok(())
    }

    async fn restore(&self, keys: &RoomKeys, (body, version): (Option<&str>, Option<u64>)) {
        let ttl = self.options.ttl;
        let version = version.map(|v| v.to_string());
        let result = async {
            for (key, value) in [(&keys.code, body), (&keys.version, version.as_deref())] {
                match value {
                    Some(value) => {
                        self.gateway.set(key, value).await?;
                        self.gateway.expire(key, ttl).await?;
                    }
                    None => {
                        self.gateway.delete(key).await?;
                    }
                }
            }
            Ok::<_, StoreError>(())
        }
        .await;
        if let Err(e) = result {
            log::error!("Could not roll back {} after a failed write: {e}", keys.code);
        }
    }

    /// The room's language tag; `None` when unset or unreadable.
    pub async fn language(&self, room: &str) -> Option<String> {
        match self.gateway.get(&RoomKeys::new(room).language).await {
            Ok(language) => language,
            Err(e) => {
                log::warn!("Storage unavailable reading language of room {room}: {e}");
                None
            }
        }
    }

    /// Persist the room's language tag. Returns `false` when dropped.
    pub async fn set_language(&self, room: &str, language: &str) -> bool {
        let key = RoomKeys::new(room).language;
        let result = async {
            self.gateway.set(&key, language).await?;
            self.gateway.expire(&key, self.options.ttl).await
        }
        .await;
        match result {
            Ok(_) => true,
            Err(e) => {
                log::warn!("Storage unavailable, dropping language of room {room}: {e}");
                false
            }
        }
    }

    /// Drop in-memory state of a room that has no sessions left.
    pub async fn forget(&self, room: &str) {
        self.versions.write().await.remove(room);
        self.write_locks.lock().await.remove(room);
    }

    /// Number of rooms with an in-memory version counter.
    pub async fn tracked_rooms(&self) -> usize {
        self.versions.read().await.len()
    }

    // ───────────────────────────────────────────────────────────────
    // Maintenance
    // ───────────────────────────────────────────────────────────────

    /// Room ids that have a persisted body.
    pub async fn stored_rooms(&self) -> Result<Vec<RoomId>, StoreError> {
        let keys = self.gateway.keys_with_prefix(ROOM_KEY_PREFIX).await?;
        Ok(keys
            .iter()
            .filter_map(|k| RoomKeys::room_of_code_key(k))
            .map(str::to_string)
            .collect())
    }

    /// Everything persisted for one room, bypassing the occupancy rule.
    pub async fn inspect(&self, room: &str) -> Result<StoredRoom, StoreError> {
        let keys = RoomKeys::new(room);
        Ok(StoredRoom {
            room_id: room.to_string(),
            body: self.gateway.get(&keys.code).await?,
            version: self.stored_version(&keys).await?,
            language: self.gateway.get(&keys.language).await?,
        })
    }

    /// Overwrite a room's persisted body, bumping the stored version.
    pub async fn reset(&self, room: &str, body: &str) -> Result<u64, StoreError> {
        let keys = RoomKeys::new(room);
        let previous_body = self.gateway.get(&keys.code).await?;
        let stored = self.stored_version(&keys).await?;
        let tracked = self.current_version(room).await.unwrap_or(0);
        let next = stored.unwrap_or(0).max(tracked) + 1;
        self.persist(&keys, body, next, (previous_body.as_deref(), stored))
            .await?;
        self.versions.write().await.insert(room.to_string(), next);
        Ok(next)
    }

    async fn stored_version(&self, keys: &RoomKeys) -> Result<Option<u64>, StoreError> {
        let Some(raw) = self.gateway.get(&keys.version).await? else {
            return Ok(None);
        };
        raw.trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| StoreError::InvalidValue {
                key: keys.version.clone(),
                reason: e.to_string(),
            })
    }

    async fn room_lock(&self, room: &str) -> Arc<Mutex<()>> {
        self.write_locks
            .lock()
            .await
            .entry(room.to_string())
            .or_default()
            .clone()
    }

    fn placeholder_snapshot(&self, degraded: bool) -> DocumentSnapshot {
        DocumentSnapshot {
            body: self.options.placeholder.clone(),
            version: 0,
            degraded,
        }
    }
}
