//! Read-through caching.
//!
//! `get_or_compute` serves a hit straight from the store. On a miss it runs
//! the caller's query, stores the JSON-encoded result and returns it.
//! Concurrent misses on one key share a single query run. The query and the
//! cache write run on a spawned task, so a caller that goes away mid-request
//! still leaves a warm entry behind, unless an invalidation covered the key
//! while the query ran.

use std::future::Future;
use std::panic;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use metrics::{counter, histogram};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::adapter::StoreAdapter;
use super::flight::{Flight, FlightLease, FlightTable, RunGuard};
use super::keys::CacheKey;
use super::store::Ttl;

pub(crate) const METRIC_CACHE_HIT_TOTAL: &str = "inkwell_cache_hit_total";
pub(crate) const METRIC_CACHE_MISS_TOTAL: &str = "inkwell_cache_miss_total";
pub(crate) const METRIC_SINGLE_FLIGHT_JOIN_TOTAL: &str = "inkwell_cache_single_flight_join_total";
pub(crate) const METRIC_COMPUTE_MS: &str = "inkwell_cache_compute_ms";

#[derive(Clone)]
pub struct ReadThroughCache {
    store: StoreAdapter,
    flights: Arc<FlightTable>,
    single_flight: bool,
    enabled: bool,
}

impl ReadThroughCache {
    pub fn new(store: StoreAdapter, enabled: bool, single_flight: bool) -> Self {
        Self {
            store,
            flights: Arc::new(FlightTable::default()),
            single_flight,
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn store(&self) -> &StoreAdapter {
        &self.store
    }

    /// Number of queries currently running.
    pub fn in_flight(&self) -> usize {
        self.flights.running()
    }

    /// Shared with the [`Invalidator`](super::Invalidator) so purges reach
    /// running queries.
    pub(crate) fn flights(&self) -> &Arc<FlightTable> {
        &self.flights
    }

    /// Return the cached value for `key`, or run `compute`, cache its result
    /// for `ttl` and return it.
    ///
    /// Errors from `compute` are returned unchanged and never cached. Store
    /// failures are invisible to the caller.
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
        if !self.enabled {
            return compute().await;
        }

        if let Some(value) = self.lookup(key).await {
            counter!(METRIC_CACHE_HIT_TOTAL, "namespace" => key.namespace().to_string())
                .increment(1);
            debug!(key = %key, outcome = "hit", "Cache lookup");
            return Ok(value);
        }
        counter!(METRIC_CACHE_MISS_TOTAL, "namespace" => key.namespace().to_string())
            .increment(1);
        debug!(key = %key, outcome = "miss", "Cache lookup");

        if !self.single_flight {
            return self.compute_and_store(key, ttl, compute, None).await;
        }

        match self.flights.join(key) {
            Flight::Leader(lease) => {
                // A previous leader may have stored the value between our
                // lookup and taking the lease.
                if let Some(payload) = self.store.get(key.as_str()).await
                    && let Some(value) = decode::<T>(key, &payload)
                {
                    lease.complete(Some(payload));
                    return Ok(value);
                }
                self.compute_and_store(key, ttl, compute, Some(lease)).await
            }
            Flight::Follower(outcome) => {
                counter!(
                    METRIC_SINGLE_FLIGHT_JOIN_TOTAL,
                    "namespace" => key.namespace().to_string()
                )
                .increment(1);
                if let Some(payload) = FlightTable::wait(outcome).await
                    && let Some(value) = decode::<T>(key, &payload)
                {
                    return Ok(value);
                }
                debug!(key = %key, "Shared query failed; computing independently");
                self.compute_and_store(key, ttl, compute, None).await
            }
        }
    }

    /// Wait for in-flight queries to finish, up to `grace`.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.flights.drain(grace).await
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let payload = self.store.get(key.as_str()).await?;
        match decode(key, &payload) {
            Some(value) => Some(value),
            None => {
                self.store.delete(key.as_str()).await;
                None
            }
        }
    }

    async fn compute_and_store<T, E, F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Ttl,
        compute: F,
        lease: Option<FlightLease>,
    ) -> Result<T, E>
    where
        T: Serialize + Send + 'static,
        E: Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let run = self.flights.start_run(key);
        let query = compute();
        let store = self.store.clone();
        let key = key.clone();

        let task = tokio::spawn(async move {
            let started = Instant::now();
            let outcome = query.await;
            histogram!(METRIC_COMPUTE_MS, "namespace" => key.namespace().to_string())
                .record(started.elapsed().as_secs_f64() * 1000.0);

            match outcome {
                Ok(value) => {
                    let payload = write_back(&store, &key, &value, ttl, &run).await;
                    if let Some(lease) = lease {
                        lease.complete(payload);
                    }
                    Ok(value)
                }
                Err(err) => {
                    if let Some(lease) = lease {
                        lease.complete(None);
                    }
                    Err(err)
                }
            }
        });

        match task.await {
            Ok(result) => result,
            Err(join_err) => match join_err.try_into_panic() {
                Ok(payload) => panic::resume_unwind(payload),
                Err(join_err) => panic!("cache compute task was cancelled: {join_err}"),
            },
        }
    }
}

/// Store the result of `run` unless an invalidation covered its key. Returns
/// the payload followers may share.
fn write_back<'a, T: Serialize>(
    store: &'a StoreAdapter,
    key: &'a CacheKey,
    value: &T,
    ttl: Ttl,
    run: &'a RunGuard,
) -> impl Future<Output = Option<Bytes>> + use<'a, T> {
    // `value` is only read before the first await, so the returned future
    // does not borrow it (keeps the spawned task `Send` without `T: Sync`).
    let encoded = if run.is_stale() {
        debug!(key = %key, "Key invalidated while computing; not caching");
        None
    } else {
        Some(encode(key, value))
    };
    async move {
        let payload = encoded??;
        store.set_with_ttl(key.as_str(), payload.clone(), ttl).await;
        if run.is_stale() {
            // The purge may have run before our write landed.
            store.delete(key.as_str()).await;
            debug!(key = %key, "Key invalidated while caching; entry removed");
            return None;
        }
        Some(payload)
    }
}

fn decode<T: DeserializeOwned>(key: &CacheKey, payload: &Bytes) -> Option<T> {
    match serde_json::from_slice(payload) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(key = %key, error = %err, "Discarding undecodable cache entry");
            None
        }
    }
}

fn encode<T: Serialize>(key: &CacheKey, value: &T) -> Option<Bytes> {
    match serde_json::to_vec(value) {
        Ok(bytes) => Some(Bytes::from(bytes)),
        Err(err) => {
            warn!(key = %key, error = %err, "Computed value is not serializable; not caching");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde::Deserialize;

    use super::*;
    use crate::cache::keys::{KeyBuilder, QueryParams};
    use crate::cache::registry::NamespaceRegistry;
    use crate::cache::store::InMemoryBackend;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Article {
        slug: String,
        likes: u32,
    }

    fn cache(enabled: bool, single_flight: bool) -> ReadThroughCache {
        let backend = InMemoryBackend::new(NonZeroUsize::new(64).expect("capacity"));
        ReadThroughCache::new(
            StoreAdapter::new(Arc::new(backend)),
            enabled,
            single_flight,
        )
    }

    fn article_key(slug: &str) -> CacheKey {
        KeyBuilder::new(Arc::new(NamespaceRegistry::blog()), true)
            .build("article", &QueryParams::new().with("slug", slug))
            .expect("key")
    }

    #[tokio::test]
    async fn miss_then_hit_computes_once() {
        let cache = cache(true, true);
        let key = article_key("hello");
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let article: Article = cache
                .get_or_compute(&key, Ttl::seconds(60), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(Article {
                        slug: "hello".to_string(),
                        likes: 3,
                    })
                })
                .await
                .expect("article");
            assert_eq!(article.likes, 3);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.in_flight(), 0);
    }

    #[tokio::test]
    async fn compute_errors_are_returned_and_not_cached() {
        let cache = cache(true, true);
        let key = article_key("missing");

        let err = cache
            .get_or_compute(&key, Ttl::seconds(60), || async {
                Err::<Article, _>("not found".to_string())
            })
            .await
            .expect_err("compute failed");
        assert_eq!(err, "not found");
        assert!(!cache.store().exists(key.as_str()).await);
    }

    #[tokio::test]
    async fn undecodable_entries_are_replaced() {
        let cache = cache(true, true);
        let key = article_key("hello");
        cache
            .store()
            .set_with_ttl(key.as_str(), Bytes::from_static(b"not json"), Ttl::seconds(60))
            .await;

        let article: Article = cache
            .get_or_compute(&key, Ttl::seconds(60), || async {
                Ok::<_, String>(Article {
                    slug: "hello".to_string(),
                    likes: 1,
                })
            })
            .await
            .expect("article");
        assert_eq!(article.likes, 1);

        let stored = cache.store().get(key.as_str()).await.expect("re-cached");
        let decoded: Article = serde_json::from_slice(&stored).expect("json");
        assert_eq!(decoded, article);
    }

    #[tokio::test]
    async fn disabled_cache_always_computes() {
        let cache = cache(false, true);
        let key = article_key("hello");
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            cache
                .get_or_compute(&key, Ttl::seconds(60), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(1_u32)
                })
                .await
                .expect("value");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!cache.store().exists(key.as_str()).await);
    }

    #[tokio::test]
    async fn without_single_flight_values_are_still_cached() {
        let cache = cache(true, false);
        let key = article_key("hello");

        let first: u32 = cache
            .get_or_compute(&key, Ttl::seconds(60), || async { Ok::<_, String>(7) })
            .await
            .expect("value");
        let second: u32 = cache
            .get_or_compute(&key, Ttl::seconds(60), || async { Ok::<_, String>(8) })
            .await
            .expect("value");

        assert_eq!((first, second), (7, 7));
        assert!(cache.drain(Duration::from_millis(1)).await);
    }
}
