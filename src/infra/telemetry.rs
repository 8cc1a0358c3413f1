use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
///
/// Fails if a subscriber is already installed.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register units and help text for every cache metric with the installed
/// recorder. Safe to call more than once.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "inkwell_cache_hit_total",
            Unit::Count,
            "Total number of read-through cache hits."
        );
        describe_counter!(
            "inkwell_cache_miss_total",
            Unit::Count,
            "Total number of read-through cache misses."
        );
        describe_counter!(
            "inkwell_cache_store_error_total",
            Unit::Count,
            "Total number of cache backend failures absorbed by the adapter."
        );
        describe_counter!(
            "inkwell_cache_evict_total",
            Unit::Count,
            "Total number of in-memory cache evictions due to capacity."
        );
        describe_counter!(
            "inkwell_cache_single_flight_join_total",
            Unit::Count,
            "Total number of misses that joined an in-flight query."
        );
        describe_counter!(
            "inkwell_cache_invalidated_keys_total",
            Unit::Count,
            "Total number of keys removed by invalidation."
        );
        describe_histogram!(
            "inkwell_cache_compute_ms",
            Unit::Milliseconds,
            "Latency of queries run on a cache miss in milliseconds."
        );
        describe_histogram!(
            "inkwell_cache_invalidate_ms",
            Unit::Milliseconds,
            "Invalidation latency in milliseconds."
        );
    });
}
