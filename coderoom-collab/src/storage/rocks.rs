//! RocksDB-backed gateway.
//!
//! Every value is stored in an envelope:
//! ```text
//! ┌──────────────────────────┬───────────────────────────────┐
//! │ expires_at_ms: Option<u64>│ payload: LZ4(value bytes)     │
//! └──────────────────────────┴───────────────────────────────┘
//! ```
//! bincode-encoded in the `rooms` column family. Expiry is enforced lazily
//! on read and by [`RocksGateway::purge_expired`].

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use super::{PersistenceGateway, StoreError};

const CF_ROOMS: &str = "rooms";

/// RocksDB configuration.
#[derive(Debug, Clone)]
pub struct RocksConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files (default: 256)
    pub max_open_files: i32,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("coderoom_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
        }
    }
}

impl RocksConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    expires_at_ms: Option<u64>,
    payload: Vec<u8>,
}

impl Envelope {
    fn wrap(value: &str) -> Self {
        Self {
            expires_at_ms: None,
            payload: lz4_flex::compress_prepend_size(value.as_bytes()),
        }
    }

    fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now_ms)
    }

    fn value(&self, key: &str) -> Result<String, StoreError> {
        let bytes = lz4_flex::decompress_size_prepended(&self.payload)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| StoreError::InvalidValue {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (envelope, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(envelope)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// RocksDB key-value gateway.
pub struct RocksGateway {
    db: DBWithThreadMode<SingleThreaded>,
    config: RocksConfig,
}

impl RocksGateway {
    /// Open (or create) the database at the configured path.
    pub fn open(config: RocksConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let mut cf_opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        cf_opts.set_block_based_table_factory(&block_opts);
        // Payloads are already LZ4 compressed.
        cf_opts.set_compression_type(DBCompressionType::None);

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            vec![ColumnFamilyDescriptor::new(CF_ROOMS, cf_opts)],
        )?;

        log::info!("Opened RocksDB gateway at {}", config.path.display());
        Ok(Self { db, config })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Delete every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize, StoreError> {
        let cf = self.cf()?;
        let now = now_ms();
        let mut batch = WriteBatch::default();
        let mut removed = 0;

        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            match Envelope::decode(&value) {
                Ok(envelope) if envelope.is_expired(now) => {
                    batch.delete_cf(cf, &key);
                    removed += 1;
                }
                Ok(_) => {}
                Err(e) => log::warn!("Skipping undecodable entry during purge: {e}"),
            }
        }

        if removed > 0 {
            self.db.write(batch)?;
            log::debug!("Purged {removed} expired entries");
        }
        Ok(removed)
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush_cf(self.cf()?)?;
        Ok(())
    }

    fn cf(&self) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(CF_ROOMS)
            .ok_or_else(|| StoreError::Database(format!("column family '{CF_ROOMS}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    /// Load a live envelope, removing it if it has expired.
    fn load(&self, key: &str) -> Result<Option<Envelope>, StoreError> {
        let cf = self.cf()?;
        let Some(bytes) = self.db.get_cf(cf, key.as_bytes())? else {
            return Ok(None);
        };
        let envelope = Envelope::decode(&bytes)?;
        if envelope.is_expired(now_ms()) {
            self.db.delete_cf_opt(cf, key.as_bytes(), &self.write_opts())?;
            return Ok(None);
        }
        Ok(Some(envelope))
    }

    fn store(&self, key: &str, envelope: &Envelope) -> Result<(), StoreError> {
        let cf = self.cf()?;
        self.db
            .put_cf_opt(cf, key.as_bytes(), envelope.encode()?, &self.write_opts())?;
        Ok(())
    }
}

#[async_trait]
impl PersistenceGateway for RocksGateway {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.load(key)? {
            Some(envelope) => envelope.value(key).map(Some),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.store(key, &Envelope::wrap(value))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let Some(mut envelope) = self.load(key)? else {
            return Ok(false);
        };
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        envelope.expires_at_ms = Some(now_ms().saturating_add(ttl_ms));
        self.store(key, &envelope)?;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let existed = self.load(key)?.is_some();
        if existed {
            self.db
                .delete_cf_opt(self.cf()?, key.as_bytes(), &self.write_opts())?;
        }
        Ok(existed)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let cf = self.cf()?;
        let now = now_ms();
        let mut keys = Vec::new();

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix.as_bytes(), Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            if Envelope::decode(&value).is_ok_and(|e| !e.is_expired(now)) {
                keys.push(String::from_utf8_lossy(&key).into_owned());
            }
        }
        Ok(keys)
    }

    fn backend_name(&self) -> &'static str {
        "rocksdb"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RocksGateway) {
        let dir = tempfile::tempdir().unwrap();
        let gw = RocksGateway::open(RocksConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, gw)
    }

    #[tokio::test]
    async fn test_open_creates_directory() {
        let (_dir, gw) = open_temp();
        assert!(gw.path().exists());
        assert_eq!(gw.backend_name(), "rocksdb");
    }

    #[tokio::test]
    async fn test_set_get_roundtrip_unicode() {
        let (_dir, gw) = open_temp();
        let body = "fn main() {\n    println!(\"héllo ✓\");\n}\n".repeat(20);
        gw.set("room:r:code", &body).await.unwrap();
        assert_eq!(gw.get("room:r:code").await.unwrap(), Some(body));
        assert_eq!(gw.get("room:r:version").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expiry_is_enforced_on_read() {
        let (_dir, gw) = open_temp();
        gw.set("k", "v").await.unwrap();
        assert!(gw.expire("k", Duration::from_millis(20)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(gw.get("k").await.unwrap(), None);
        assert!(!gw.expire("k", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_unbounded_ttl_saturates() {
        let (_dir, gw) = open_temp();
        gw.set("k", "v").await.unwrap();
        assert!(gw.expire("k", Duration::MAX).await.unwrap());
        assert_eq!(gw.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(gw.purge_expired().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (_dir, gw) = open_temp();
        gw.set("a", "1").await.unwrap();
        gw.set("b", "2").await.unwrap();
        gw.expire("a", Duration::from_millis(10)).await.unwrap();
        gw.expire("b", Duration::from_secs(3600)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(gw.purge_expired().unwrap(), 1);
        assert_eq!(gw.get("b").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_keys_with_prefix_skips_expired() {
        let (_dir, gw) = open_temp();
        gw.set("room:a:code", "x").await.unwrap();
        gw.set("room:b:code", "y").await.unwrap();
        gw.set("zzz", "z").await.unwrap();
        gw.expire("room:b:code", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let keys = gw.keys_with_prefix("room:").await.unwrap();
        assert_eq!(keys, vec!["room:a:code".to_string()]);
    }

    #[tokio::test]
    async fn test_data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let gw = RocksGateway::open(RocksConfig::for_testing(&path)).unwrap();
            gw.set("room:r:code", "persisted").await.unwrap();
            gw.flush().unwrap();
        }
        let gw = RocksGateway::open(RocksConfig::for_testing(&path)).unwrap();
        assert_eq!(gw.get("room:r:code").await.unwrap().as_deref(), Some("persisted"));
    }

    #[tokio::test]
    async fn test_delete() {
        let (_dir, gw) = open_temp();
        gw.set("k", "v").await.unwrap();
        assert!(gw.delete("k").await.unwrap());
        assert!(!gw.delete("k").await.unwrap());
    }
}
