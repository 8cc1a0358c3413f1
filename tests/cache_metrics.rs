use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use inkwell_cache::cache::{
    CacheBackend, CacheConfig, CacheContext, InMemoryBackend, InvalidationContext, QueryParams,
    StoreError, Ttl, resources,
};
use metrics_util::debugging::DebuggingRecorder;

struct UnreachableBackend;

#[async_trait]
impl CacheBackend for UnreachableBackend {
    fn name(&self) -> &'static str {
        "unreachable"
    }

    async fn get(&self, _key: &str) -> Result<Option<Bytes>, StoreError> {
        Err(StoreError::unavailable("connection refused"))
    }

    async fn set(&self, _key: &str, _payload: Bytes, _ttl: Ttl) -> Result<(), StoreError> {
        Err(StoreError::unavailable("connection refused"))
    }

    async fn delete(&self, _key: &str) -> Result<bool, StoreError> {
        Err(StoreError::unavailable("connection refused"))
    }

    async fn delete_many(&self, _keys: &[String]) -> Result<usize, StoreError> {
        Err(StoreError::unavailable("connection refused"))
    }

    async fn keys_with_prefix(&self, _prefix: &str) -> Result<Vec<String>, StoreError> {
        Err(StoreError::unavailable("connection refused"))
    }

    async fn exists(&self, _key: &str) -> Result<bool, StoreError> {
        Err(StoreError::unavailable("connection refused"))
    }
}

fn memory(capacity: usize) -> Arc<dyn CacheBackend> {
    Arc::new(InMemoryBackend::new(
        NonZeroUsize::new(capacity).expect("capacity"),
    ))
}

#[tokio::test(start_paused = true)]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    inkwell_cache::infra::telemetry::describe_metrics();

    let config = CacheConfig::default();

    // Hit, miss, compute latency, single-flight join
    let cache = CacheContext::new(&config, memory(16)).expect("cache context");
    let key = cache
        .build_key("tag-list", &QueryParams::new())
        .expect("tag key");
    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute_in(&key, || async {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, String>(vec!["rust".to_string()])
                    })
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.expect("join").expect("tags");
    }
    let tags: Vec<String> = cache
        .get_or_compute_in(&key, || async { Ok::<_, String>(Vec::new()) })
        .await
        .expect("cached tags");
    assert_eq!(tags, vec!["rust".to_string()]);

    // Invalidation latency and removed keys
    let report = cache
        .invalidate(resources::TAG, &InvalidationContext::new())
        .await
        .expect("invalidate");
    assert_eq!(report.deleted, 1);

    // Eviction due to capacity
    let tiny = CacheContext::new(&config, memory(1)).expect("cache context");
    for slug in ["one", "two"] {
        let key = tiny
            .build_key("article", &QueryParams::new().with("slug", slug))
            .expect("article key");
        tiny.get_or_compute_in(&key, || async { Ok::<_, String>(1_u32) })
            .await
            .expect("article");
    }

    // Absorbed backend failure
    let broken = CacheContext::new(&config, Arc::new(UnreachableBackend)).expect("cache context");
    let value: u32 = broken
        .get_or_compute(&key, Ttl::seconds(5), || async { Ok::<_, String>(3) })
        .await
        .expect("value despite store failure");
    assert_eq!(value, 3);

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "inkwell_cache_hit_total",
        "inkwell_cache_miss_total",
        "inkwell_cache_store_error_total",
        "inkwell_cache_evict_total",
        "inkwell_cache_single_flight_join_total",
        "inkwell_cache_compute_ms",
        "inkwell_cache_invalidate_ms",
        "inkwell_cache_invalidated_keys_total",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
