//! Post-commit invalidation.
//!
//! Call [`Invalidator::invalidate`] only after the write has committed.
//! Queries already running for a purged key are marked stale first: their
//! results are not cached and not shared with later callers, who run a fresh
//! query instead.

use std::sync::Arc;

use futures::future::join_all;
use metrics::{counter, histogram};
use tokio::time::Instant;
use tracing::{info, warn};

use super::adapter::StoreAdapter;
use super::config::Granularity;
use super::error::CacheError;
use super::events::{InvalidationContext, WriteEvent};
use super::flight::FlightTable;
use super::keys::KeyPattern;
use super::planner::InvalidationPlan;
use super::rules::InvalidationRules;

pub(crate) const METRIC_INVALIDATE_MS: &str = "inkwell_cache_invalidate_ms";
pub(crate) const METRIC_INVALIDATED_KEYS_TOTAL: &str = "inkwell_cache_invalidated_keys_total";

/// Outcome of one invalidation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    /// Patterns issued to the store.
    pub patterns: Vec<KeyPattern>,
    /// Keys removed across all patterns.
    pub deleted: usize,
    /// Patterns whose purge failed; their entries expire on TTL instead.
    pub failed: Vec<KeyPattern>,
}

impl InvalidationReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Clone)]
pub struct Invalidator {
    store: StoreAdapter,
    rules: Arc<InvalidationRules>,
    granularity: Granularity,
    flights: Option<Arc<FlightTable>>,
}

impl Invalidator {
    pub fn new(store: StoreAdapter, rules: Arc<InvalidationRules>, granularity: Granularity) -> Self {
        Self {
            store,
            rules,
            granularity,
            flights: None,
        }
    }

    /// Reach the queries tracked by `flights` on every purge.
    pub(crate) fn tracking(mut self, flights: Arc<FlightTable>) -> Self {
        self.flights = Some(flights);
        self
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn rules(&self) -> &InvalidationRules {
        &self.rules
    }

    /// Purge every entry a committed write to `resource` may have made stale.
    ///
    /// Store failures are reported, never returned: every pattern is
    /// attempted even if an earlier one failed. Repeating the call is harmless.
    pub async fn invalidate(
        &self,
        resource: &str,
        context: &InvalidationContext,
    ) -> Result<InvalidationReport, CacheError> {
        let plan = InvalidationPlan::for_write(resource, context, &self.rules, self.granularity)?;
        Ok(self.execute(plan).await)
    }

    /// Merge a batch of writes into one plan and execute it.
    pub async fn invalidate_all(
        &self,
        events: &[WriteEvent],
    ) -> Result<InvalidationReport, CacheError> {
        let plan = InvalidationPlan::from_events(events, &self.rules, self.granularity)?;
        Ok(self.execute(plan).await)
    }

    pub async fn execute(&self, plan: InvalidationPlan) -> InvalidationReport {
        if plan.is_empty() {
            return InvalidationReport::default();
        }

        let started = Instant::now();
        let patterns: Vec<KeyPattern> = plan.patterns().cloned().collect();
        let stale_runs: usize = self.flights.as_ref().map_or(0, |flights| {
            patterns
                .iter()
                .map(|pattern| flights.invalidate(pattern))
                .sum()
        });
        let outcomes = join_all(patterns.iter().map(|pattern| self.store.purge(pattern))).await;

        let mut report = InvalidationReport {
            patterns: patterns.clone(),
            ..InvalidationReport::default()
        };
        for (pattern, outcome) in patterns.into_iter().zip(outcomes) {
            match outcome {
                Some(removed) => {
                    report.deleted += removed;
                    counter!(
                        METRIC_INVALIDATED_KEYS_TOTAL,
                        "namespace" => pattern.namespace_name().to_string()
                    )
                    .increment(removed as u64);
                }
                None => report.failed.push(pattern),
            }
        }

        histogram!(METRIC_INVALIDATE_MS).record(started.elapsed().as_secs_f64() * 1000.0);

        if report.is_complete() {
            info!(
                plan = %plan,
                deleted = report.deleted,
                stale_runs,
                "Cache invalidated"
            );
        } else {
            warn!(
                plan = %plan,
                deleted = report.deleted,
                failed = report.failed.len(),
                stale_runs,
                "Cache invalidation incomplete; stale entries expire on TTL"
            );
        }

        report
    }
}
