//! In-process gateway with lazy expiry.
//!
//! Holds nothing across restarts. The availability switch lets tests (and
//! operators poking at a running server) simulate a storage outage.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use super::{PersistenceGateway, StoreError};

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// TTL-aware in-memory key-value store.
#[derive(Debug)]
pub struct MemoryGateway {
    entries: RwLock<BTreeMap<String, MemoryEntry>>,
    available: AtomicBool,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle simulated availability. While unavailable every call fails
    /// with [`StoreError::Unavailable`]; stored data is kept.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remaining time to live of a key, if it has one.
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        let entry = entries.get(key).filter(|e| !e.is_expired(now))?;
        entry.expires_at.map(|at| at.saturating_duration_since(now))
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory gateway switched off".into()))
        }
    }
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check()?;
        self.entries.write().await.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check()?;
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                // A deadline past what Instant can represent never expires
                entry.expires_at = now.checked_add(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check()?;
        let now = Instant::now();
        let removed = self.entries.write().await.remove(key);
        Ok(removed.is_some_and(|e| !e.is_expired(now)))
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.check()?;
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get() {
        let gw = MemoryGateway::new();
        assert_eq!(gw.get("a").await.unwrap(), None);
        gw.set("a", "1").await.unwrap();
        assert_eq!(gw.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(gw.len().await, 1);
    }

    #[tokio::test]
    async fn test_expire_missing_key() {
        let gw = MemoryGateway::new();
        assert!(!gw.expire("missing", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_unbounded_ttl_never_expires() {
        let gw = MemoryGateway::new();
        gw.set("a", "1").await.unwrap();
        assert!(gw.expire("a", Duration::MAX).await.unwrap());
        assert_eq!(gw.get("a").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let gw = MemoryGateway::new();
        gw.set("a", "1").await.unwrap();
        assert!(gw.expire("a", Duration::from_millis(20)).await.unwrap());
        assert!(gw.ttl("a").await.is_some());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(gw.get("a").await.unwrap(), None);
        assert!(gw.is_empty().await);
    }

    #[tokio::test]
    async fn test_set_clears_expiry() {
        let gw = MemoryGateway::new();
        gw.set("a", "1").await.unwrap();
        gw.expire("a", Duration::from_secs(60)).await.unwrap();
        gw.set("a", "2").await.unwrap();
        assert_eq!(gw.ttl("a").await, None);
    }

    #[tokio::test]
    async fn test_unavailable_keeps_data() {
        let gw = MemoryGateway::new();
        gw.set("a", "1").await.unwrap();
        gw.set_available(false);
        assert!(matches!(gw.get("a").await, Err(StoreError::Unavailable(_))));
        assert!(gw.set("b", "2").await.is_err());
        gw.set_available(true);
        assert_eq!(gw.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(gw.get("b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_keys_with_prefix() {
        let gw = MemoryGateway::new();
        gw.set("room:a:code", "x").await.unwrap();
        gw.set("room:b:code", "y").await.unwrap();
        gw.set("rooms", "z").await.unwrap();
        gw.set("other", "w").await.unwrap();
        let keys = gw.keys_with_prefix("room:").await.unwrap();
        assert_eq!(keys, vec!["room:a:code".to_string(), "room:b:code".to_string()]);
    }

    #[tokio::test]
    async fn test_delete() {
        let gw = MemoryGateway::new();
        gw.set("a", "1").await.unwrap();
        assert!(gw.delete("a").await.unwrap());
        assert!(!gw.delete("a").await.unwrap());
    }
}
