//! Failure policy around a cache backend.
//!
//! The cache must never turn a healthy request into a failed one. Read
//! failures degrade to a miss; write, delete and purge failures are logged
//! and counted, then swallowed. Only programmer errors (bad TTLs, bad
//! patterns) reach the caller.

use std::sync::Arc;

use bytes::Bytes;
use metrics::counter;
use tracing::{debug, error, warn};

use super::error::{CacheError, StoreError};
use super::keys::KeyPattern;
use super::store::{CacheBackend, Ttl};

pub(crate) const METRIC_STORE_ERROR_TOTAL: &str = "inkwell_cache_store_error_total";

/// Shared handle to a backend. Cloning is cheap.
#[derive(Clone)]
pub struct StoreAdapter {
    backend: Arc<dyn CacheBackend>,
}

impl StoreAdapter {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Fetch a payload. Backend errors are reported as a miss.
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        match self.backend.get(key).await {
            Ok(payload) => payload,
            Err(err) => {
                record_failure("get", &err);
                warn!(
                    key,
                    backend = self.backend.name(),
                    error = %err,
                    "Cache read failed; treating as miss"
                );
                None
            }
        }
    }

    /// Store a payload, replacing any previous entry.
    pub async fn set_with_ttl(&self, key: &str, payload: Bytes, ttl: Ttl) {
        if let Err(err) = self.backend.set(key, payload, ttl).await {
            record_failure("set", &err);
            error!(
                key,
                ttl_secs = ttl.as_secs(),
                backend = self.backend.name(),
                error = %err,
                "Cache write failed"
            );
        }
    }

    /// Like [`set_with_ttl`](Self::set_with_ttl) for a TTL given in seconds.
    pub async fn set_with_ttl_secs(
        &self,
        key: &str,
        payload: Bytes,
        ttl_secs: u64,
    ) -> Result<(), CacheError> {
        let ttl = Ttl::from_secs(ttl_secs)?;
        self.set_with_ttl(key, payload, ttl).await;
        Ok(())
    }

    /// Remove a key. Absent keys and backend errors both report `false`.
    pub async fn delete(&self, key: &str) -> bool {
        match self.backend.delete(key).await {
            Ok(removed) => removed,
            Err(err) => {
                record_failure("delete", &err);
                error!(
                    key,
                    backend = self.backend.name(),
                    error = %err,
                    "Cache delete failed"
                );
                false
            }
        }
    }

    /// Remove every key matching `pattern`, returning how many were removed.
    pub async fn delete_by_pattern(&self, pattern: &KeyPattern) -> usize {
        self.purge(pattern).await.unwrap_or_default()
    }

    /// Parse `pattern` and purge it.
    pub async fn delete_matching(&self, pattern: &str) -> Result<usize, CacheError> {
        let pattern = KeyPattern::parse(pattern)?;
        Ok(self.delete_by_pattern(&pattern).await)
    }

    /// Purge `pattern`. `None` means the backend failed and the purge may be
    /// incomplete.
    pub(crate) async fn purge(&self, pattern: &KeyPattern) -> Option<usize> {
        let result = async {
            let keys = self.backend.keys_with_prefix(pattern.prefix()).await?;
            if keys.is_empty() {
                return Ok(0);
            }
            self.backend.delete_many(&keys).await
        }
        .await;

        match result {
            Ok(removed) => {
                debug!(pattern = %pattern, removed, "Cache pattern purged");
                Some(removed)
            }
            Err(err) => {
                record_failure("delete_pattern", &err);
                error!(
                    pattern = %pattern,
                    backend = self.backend.name(),
                    error = %err,
                    "Cache pattern purge failed; entries may stay stale until expiry"
                );
                None
            }
        }
    }

    /// Whether a live entry exists. Backend errors report `false`.
    pub async fn exists(&self, key: &str) -> bool {
        match self.backend.exists(key).await {
            Ok(found) => found,
            Err(err) => {
                record_failure("exists", &err);
                warn!(key, error = %err, "Cache exists check failed");
                false
            }
        }
    }

    /// Release backend resources.
    pub async fn close(&self) {
        if let Err(err) = self.backend.close().await {
            record_failure("close", &err);
            warn!(backend = self.backend.name(), error = %err, "Cache backend close failed");
        }
    }
}

fn record_failure(op: &'static str, err: &StoreError) {
    counter!(METRIC_STORE_ERROR_TOTAL, "op" => op, "kind" => err.kind()).increment(1);
}
