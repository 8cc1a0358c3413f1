//! Cache backends.
//!
//! A backend is a plain key-value store with per-entry expiry. It reports
//! failures as `StoreError`; deciding what a failure means for the caller is
//! the adapter's job, not the backend's.

use std::num::{NonZeroU64, NonZeroUsize};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use metrics::counter;
use tokio::time::Instant;

use super::error::{CacheError, StoreError};
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";
const METRIC_CACHE_EVICT_TOTAL: &str = "inkwell_cache_evict_total";

/// Longest accepted TTL: one year.
pub const MAX_TTL_SECS: u64 = 365 * 24 * 60 * 60;

/// Time-to-live of a cache entry, between one second and [`MAX_TTL_SECS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ttl(NonZeroU64);

impl Ttl {
    /// Validate a TTL given in seconds.
    pub fn from_secs(secs: u64) -> Result<Self, CacheError> {
        NonZeroU64::new(secs)
            .filter(|secs| secs.get() <= MAX_TTL_SECS)
            .map(Self)
            .ok_or(CacheError::InvalidTtl(secs))
    }

    /// Compile-time TTL constant.
    pub const fn seconds(secs: u64) -> Self {
        match NonZeroU64::new(secs) {
            Some(secs) if secs.get() <= MAX_TTL_SECS => Self(secs),
            _ => panic!("ttl constants must be between 1 second and one year"),
        }
    }

    pub fn as_secs(&self) -> u64 {
        self.0.get()
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.0.get())
    }
}

/// Key-value storage behind the cache.
///
/// Implementations must be safe to call concurrently and every operation must
/// be idempotent on retry.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> &'static str;

    /// Fetch a live entry. Expired entries are reported as absent.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// Store `payload` under `key`, replacing any previous entry.
    async fn set(&self, key: &str, payload: Bytes, ttl: Ttl) -> Result<(), StoreError>;

    /// Remove `key`. Returns whether an entry was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Remove every key in `keys`, returning how many existed.
    async fn delete_many(&self, keys: &[String]) -> Result<usize, StoreError>;

    /// Enumerate live keys starting with `prefix`.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Release connections. Called once at shutdown.
    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Clone)]
struct Entry {
    payload: Bytes,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Bounded in-process backend with LRU eviction and per-entry expiry.
///
/// Expiry is measured on the tokio clock, so tests can drive it with
/// `tokio::time::pause` and `advance`.
pub struct InMemoryBackend {
    entries: RwLock<LruCache<String, Entry>>,
}

impl InMemoryBackend {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
        }
    }

    /// Number of stored entries, including ones that expired but were not
    /// yet observed.
    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut entries = rw_write(&self.entries, SOURCE, "purge_expired");
        remove_expired(&mut entries, Instant::now())
    }
}

fn remove_expired(entries: &mut LruCache<String, Entry>, now: Instant) -> usize {
    let expired: Vec<String> = entries
        .iter()
        .filter(|(_, entry)| !entry.is_live(now))
        .map(|(key, _)| key.clone())
        .collect();
    for key in &expired {
        entries.pop(key);
    }
    expired.len()
}

#[async_trait]
impl CacheBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let now = Instant::now();
        let mut entries = rw_write(&self.entries, SOURCE, "get");
        let live = entries
            .get(key)
            .map(|entry| entry.is_live(now).then(|| entry.payload.clone()));
        match live {
            Some(Some(payload)) => Ok(Some(payload)),
            Some(None) => {
                entries.pop(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, payload: Bytes, ttl: Ttl) -> Result<(), StoreError> {
        let now = Instant::now();
        let entry = Entry {
            payload,
            expires_at: now + ttl.as_duration(),
        };
        let mut entries = rw_write(&self.entries, SOURCE, "set");
        // Dead entries go before a live one is evicted for capacity.
        if entries.len() == entries.cap().get() && !entries.contains(key) {
            remove_expired(&mut entries, now);
        }
        let evicted = entries.push(key.to_string(), entry);
        drop(entries);
        if let Some((evicted_key, _)) = evicted
            && evicted_key != key
        {
            counter!(METRIC_CACHE_EVICT_TOTAL).increment(1);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(rw_write(&self.entries, SOURCE, "delete").pop(key).is_some())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<usize, StoreError> {
        let mut entries = rw_write(&self.entries, SOURCE, "delete_many");
        Ok(keys
            .iter()
            .filter(|key| entries.pop(key.as_str()).is_some())
            .count())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        Ok(rw_read(&self.entries, SOURCE, "keys_with_prefix")
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        Ok(rw_read(&self.entries, SOURCE, "exists")
            .peek(key)
            .is_some_and(|entry| entry.is_live(now)))
    }
}
