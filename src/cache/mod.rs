//! Inkwell read-through cache
//!
//! Caches query results for the blogging API and purges them after writes:
//!
//! - **Keys**: `namespace:param=value:...`, deterministic for a given query
//! - **Read-through**: `get_or_compute` with per-key single-flight
//! - **Invalidation**: write rules map a committed write to namespace patterns
//!
//! ## Configuration
//!
//! Cache behavior is controlled via the `[cache]` table:
//!
//! ```toml
//! [cache]
//! enabled = true
//! granularity = "fine"
//! backend = "memory"
//! memory_max_entries = 10000
//! # ... see config.rs for all options
//! ```

mod adapter;
pub(crate) mod config;
mod context;
mod error;
mod events;
mod flight;
mod invalidation;
mod keys;
mod lock;
mod planner;
#[cfg(feature = "redis")]
mod redis;
pub mod registry;
pub mod rules;
mod service;
mod store;

pub use adapter::StoreAdapter;
pub use config::{BackendKind, CacheConfig, Granularity};
pub use context::{CacheContext, backend_from_config};
pub use error::{CacheError, StoreError};
pub use events::{InvalidationContext, WriteEvent};
pub use invalidation::{InvalidationReport, Invalidator};
pub use keys::{CacheKey, KeyBuilder, KeyPattern, ParamValue, QueryParams};
pub use planner::InvalidationPlan;
#[cfg(feature = "redis")]
pub use redis::RedisBackend;
pub use registry::{Namespace, NamespaceRegistry};
pub use rules::{InvalidationRule, InvalidationRules, resources};
pub use service::ReadThroughCache;
pub use store::{CacheBackend, InMemoryBackend, MAX_TTL_SECS, Ttl};
