//! Cache configuration.
//!
//! Controls the backend, read-through behavior and invalidation granularity
//! via the `[cache]` table of `inkwell.toml`.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

use super::error::CacheError;
use super::store::Ttl;

// Default values for cache configuration, shared with the settings loader
pub(crate) const DEFAULT_TTL_SECS: u64 = 300;
pub(crate) const DEFAULT_MEMORY_MAX_ENTRIES: usize = 10_000;
pub(crate) const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;
pub(crate) const DEFAULT_KEY_PREFIX: &str = "inkwell:";

/// How precisely writes are mapped to purges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// Honor rule scopes: a like on one article purges only that article.
    #[default]
    Fine,
    /// Always purge whole namespaces.
    Coarse,
}

/// Which backend stores cache entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Redis,
}

/// Cache configuration from `inkwell.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// When false every read goes straight to the query.
    pub enabled: bool,
    /// Reject namespaces and parameters missing from the registry.
    pub strict_namespaces: bool,
    /// Share one query run between concurrent misses on a key.
    pub single_flight: bool,
    pub granularity: Granularity,
    /// TTL for ad hoc namespaces outside the registry.
    pub default_ttl_secs: u64,
    /// Per-namespace TTL overrides, in seconds.
    pub ttl_overrides: BTreeMap<String, u64>,
    pub backend: BackendKind,
    /// Maximum entries held by the in-memory backend.
    pub memory_max_entries: usize,
    pub redis_url: Option<String>,
    /// Prefix applied to every key stored in redis.
    pub key_prefix: String,
    /// How long shutdown waits for in-flight queries.
    pub shutdown_grace_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strict_namespaces: true,
            single_flight: true,
            granularity: Granularity::default(),
            default_ttl_secs: DEFAULT_TTL_SECS,
            ttl_overrides: BTreeMap::new(),
            backend: BackendKind::default(),
            memory_max_entries: DEFAULT_MEMORY_MAX_ENTRIES,
            redis_url: None,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            strict_namespaces: settings.strict_namespaces,
            single_flight: settings.single_flight,
            granularity: settings.granularity,
            default_ttl_secs: settings.default_ttl.as_secs(),
            ttl_overrides: settings.ttl_overrides.clone(),
            backend: settings.backend,
            memory_max_entries: settings.memory_max_entries.get(),
            redis_url: settings.redis_url.clone(),
            key_prefix: settings.key_prefix.clone(),
            shutdown_grace_ms: settings.shutdown_grace.as_millis() as u64,
        }
    }
}

impl CacheConfig {
    /// TTL for ad hoc namespaces.
    pub fn default_ttl(&self) -> Result<Ttl, CacheError> {
        Ttl::from_secs(self.default_ttl_secs)
    }

    /// Returns the memory entry limit as NonZeroUsize, clamping to 1 if zero.
    pub fn memory_max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.memory_max_entries).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
