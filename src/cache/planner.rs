//! Invalidation plan generation.
//!
//! Turns one or more write events into the minimal set of patterns to purge.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use super::config::Granularity;
use super::error::CacheError;
use super::events::{InvalidationContext, WriteEvent};
use super::keys::KeyPattern;
use super::rules::{InvalidationRule, InvalidationRules};

/// Patterns to purge for a batch of writes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InvalidationPlan {
    patterns: BTreeSet<KeyPattern>,
    events: usize,
}

impl fmt::Display for InvalidationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let patterns: Vec<&str> = self.patterns.iter().map(KeyPattern::as_str).collect();
        write!(
            f,
            "InvalidationPlan {{ events: {}, patterns: [{}] }}",
            self.events,
            patterns.join(", ")
        )
    }
}

impl InvalidationPlan {
    /// Plan for a single write.
    pub fn for_write(
        resource: &str,
        context: &InvalidationContext,
        rules: &InvalidationRules,
        granularity: Granularity,
    ) -> Result<Self, CacheError> {
        let mut plan = Self {
            events: 1,
            ..Self::default()
        };
        plan.add(resource, context, rules, granularity)?;
        plan.collapse();
        Ok(plan)
    }

    /// Merge several writes into one plan.
    ///
    /// - Deduplicates by event ID
    /// - A whole-namespace purge absorbs scoped purges of that namespace
    pub fn from_events(
        events: &[WriteEvent],
        rules: &InvalidationRules,
        granularity: Granularity,
    ) -> Result<Self, CacheError> {
        let mut plan = Self::default();
        let mut seen_ids = HashSet::new();

        for event in events.iter().filter(|event| seen_ids.insert(event.id)) {
            plan.add(&event.resource, &event.context, rules, granularity)?;
            plan.events += 1;
        }

        plan.collapse();
        Ok(plan)
    }

    pub fn patterns(&self) -> impl Iterator<Item = &KeyPattern> {
        self.patterns.iter()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Number of distinct events merged into this plan.
    pub fn event_count(&self) -> usize {
        self.events
    }

    fn add(
        &mut self,
        resource: &str,
        context: &InvalidationContext,
        rules: &InvalidationRules,
        granularity: Granularity,
    ) -> Result<(), CacheError> {
        for rule in rules.rules_for(resource)? {
            self.patterns
                .insert(pattern_for(rule, context, rules, granularity)?);
        }
        Ok(())
    }

    fn collapse(&mut self) {
        let wide: BTreeSet<String> = self
            .patterns
            .iter()
            .filter(|pattern| pattern.is_namespace_wide())
            .map(|pattern| pattern.namespace_name().to_string())
            .collect();
        self.patterns.retain(|pattern| {
            pattern.is_namespace_wide() || !wide.contains(pattern.namespace_name())
        });
    }
}

fn pattern_for(
    rule: &InvalidationRule,
    context: &InvalidationContext,
    rules: &InvalidationRules,
    granularity: Granularity,
) -> Result<KeyPattern, CacheError> {
    let scoped = match (granularity, rule.scope_field()) {
        (Granularity::Fine, Some(field)) => context.get(field),
        _ => None,
    };
    let scope_param = rules.scope_param(rule.namespace());
    match (scoped, scope_param) {
        (Some(value), Some(param)) => KeyPattern::scoped(rule.namespace(), param, value),
        _ => KeyPattern::namespace(rule.namespace()),
    }
}
