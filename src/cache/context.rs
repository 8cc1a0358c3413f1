//! The cache as handed to request handlers.
//!
//! `CacheContext` is built once at startup and shared by cloning; there is
//! no global cache instance.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use super::adapter::StoreAdapter;
use super::config::{BackendKind, CacheConfig};
use super::error::{CacheError, StoreError};
use super::events::{InvalidationContext, WriteEvent};
use super::invalidation::{InvalidationReport, Invalidator};
use super::keys::{CacheKey, KeyBuilder, QueryParams};
use super::registry::NamespaceRegistry;
use super::rules::InvalidationRules;
use super::service::ReadThroughCache;
use super::store::{CacheBackend, InMemoryBackend, Ttl};

#[derive(Clone)]
pub struct CacheContext {
    config: Arc<CacheConfig>,
    keys: KeyBuilder,
    cache: ReadThroughCache,
    invalidator: Invalidator,
    default_ttl: Ttl,
}

impl CacheContext {
    /// Context for the blogging API's namespaces and rules.
    pub fn new(config: &CacheConfig, backend: Arc<dyn CacheBackend>) -> Result<Self, CacheError> {
        let registry = NamespaceRegistry::blog();
        let rules = InvalidationRules::blog(&registry)?;
        Self::with_registry(config, registry, rules, backend)
    }

    /// Context over a custom registry. TTL overrides from `config` are
    /// applied to `registry` here.
    pub fn with_registry(
        config: &CacheConfig,
        registry: NamespaceRegistry,
        rules: InvalidationRules,
        backend: Arc<dyn CacheBackend>,
    ) -> Result<Self, CacheError> {
        let default_ttl = config.default_ttl()?;
        let registry = Arc::new(registry.with_ttl_overrides(&config.ttl_overrides)?);
        let store = StoreAdapter::new(backend);

        info!(
            backend = store.backend_name(),
            enabled = config.enabled,
            strict = config.strict_namespaces,
            single_flight = config.single_flight,
            granularity = ?config.granularity,
            namespaces = registry.len(),
            "Cache context ready"
        );

        let cache = ReadThroughCache::new(store.clone(), config.enabled, config.single_flight);
        let invalidator = Invalidator::new(store, Arc::new(rules), config.granularity)
            .tracking(Arc::clone(cache.flights()));

        Ok(Self {
            keys: KeyBuilder::new(registry, config.strict_namespaces),
            cache,
            invalidator,
            default_ttl,
            config: Arc::new(config.clone()),
        })
    }

    /// Build the backend selected by `config` and a context over it.
    pub async fn connect(config: &CacheConfig) -> Result<Self, crate::infra::error::InfraError> {
        let backend = backend_from_config(config).await?;
        Ok(Self::new(config, backend)?)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn registry(&self) -> &NamespaceRegistry {
        self.keys.registry()
    }

    pub fn store(&self) -> &StoreAdapter {
        self.cache.store()
    }

    pub fn read_through(&self) -> &ReadThroughCache {
        &self.cache
    }

    pub fn invalidator(&self) -> &Invalidator {
        &self.invalidator
    }

    pub fn build_key(&self, namespace: &str, params: &QueryParams) -> Result<CacheKey, CacheError> {
        self.keys.build(namespace, params)
    }

    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Ttl,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        E: Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.cache.get_or_compute(key, ttl, compute).await
    }

    /// [`get_or_compute`](Self::get_or_compute) with the TTL registered for
    /// the key's namespace.
    pub async fn get_or_compute_in<T, E, F, Fut>(&self, key: &CacheKey, compute: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        E: Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let ttl = self.ttl_for(key.namespace());
        self.cache.get_or_compute(key, ttl, compute).await
    }

    /// Registered TTL of `namespace`, or the configured default for ad hoc
    /// namespaces.
    pub fn ttl_for(&self, namespace: &str) -> Ttl {
        self.registry()
            .get(namespace)
            .map_or(self.default_ttl, |entry| entry.default_ttl())
    }

    pub async fn invalidate(
        &self,
        resource: &str,
        context: &InvalidationContext,
    ) -> Result<InvalidationReport, CacheError> {
        self.invalidator.invalidate(resource, context).await
    }

    pub async fn invalidate_all(
        &self,
        events: &[WriteEvent],
    ) -> Result<InvalidationReport, CacheError> {
        self.invalidator.invalidate_all(events).await
    }

    /// Let in-flight queries finish their cache writes, then release the
    /// backend.
    pub async fn shutdown(&self) {
        let grace = self.config.shutdown_grace();
        if !self.cache.drain(grace).await {
            warn!(
                in_flight = self.cache.in_flight(),
                grace_ms = grace.as_millis() as u64,
                "Cache shutdown grace elapsed with queries in flight"
            );
        }
        self.store().close().await;
        info!("Cache shut down");
    }
}

/// Build the backend selected by `config`.
pub async fn backend_from_config(
    config: &CacheConfig,
) -> Result<Arc<dyn CacheBackend>, StoreError> {
    match config.backend {
        BackendKind::Memory => Ok(Arc::new(InMemoryBackend::new(
            config.memory_max_entries_non_zero(),
        ))),
        BackendKind::Redis => redis_backend(config).await,
    }
}

#[cfg(feature = "redis")]
async fn redis_backend(config: &CacheConfig) -> Result<Arc<dyn CacheBackend>, StoreError> {
    let url = config
        .redis_url
        .as_deref()
        .ok_or_else(|| StoreError::unavailable("cache.redis_url is not set"))?;
    let backend = super::redis::RedisBackend::connect(url, config.key_prefix.clone()).await?;
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "redis"))]
async fn redis_backend(_config: &CacheConfig) -> Result<Arc<dyn CacheBackend>, StoreError> {
    Err(StoreError::unavailable(
        "redis backend requested but the `redis` feature is not enabled",
    ))
}
