//! Write-to-namespace invalidation rules.
//!
//! A rule says which namespace a write to a resource makes stale and,
//! optionally, which field of the write's context narrows the purge to the
//! namespace's scope segment.

use std::collections::BTreeMap;

use super::error::CacheError;
use super::registry::{self, NamespaceRegistry};

/// Resource types that publish writes.
pub mod resources {
    pub const ARTICLE: &str = "article";
    pub const COMMENT: &str = "comment";
    pub const LIKE: &str = "like";
    pub const TAG: &str = "tag";
    pub const USER: &str = "user";
    pub const SUBSCRIPTION: &str = "subscription";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidationRule {
    resource: &'static str,
    namespace: &'static str,
    scope_field: Option<&'static str>,
}

impl InvalidationRule {
    /// Purge the whole namespace on every write.
    pub const fn purge(resource: &'static str, namespace: &'static str) -> Self {
        Self {
            resource,
            namespace,
            scope_field: None,
        }
    }

    /// Purge only the entries whose scope equals the write's `field` value.
    pub const fn scoped(
        resource: &'static str,
        namespace: &'static str,
        field: &'static str,
    ) -> Self {
        Self {
            resource,
            namespace,
            scope_field: Some(field),
        }
    }

    pub fn resource(&self) -> &'static str {
        self.resource
    }

    pub fn namespace(&self) -> &'static str {
        self.namespace
    }

    /// Context field whose value selects the scope to purge.
    pub fn scope_field(&self) -> Option<&'static str> {
        self.scope_field
    }
}

/// Rules indexed by resource type.
#[derive(Debug, Clone)]
pub struct InvalidationRules {
    by_resource: BTreeMap<&'static str, Vec<InvalidationRule>>,
    scopes: BTreeMap<&'static str, &'static str>,
}

impl InvalidationRules {
    /// Index `rules`, checking every target against `registry`.
    pub fn new(
        rules: impl IntoIterator<Item = InvalidationRule>,
        registry: &NamespaceRegistry,
    ) -> Result<Self, CacheError> {
        let mut by_resource: BTreeMap<&'static str, Vec<InvalidationRule>> = BTreeMap::new();
        let mut scopes = BTreeMap::new();
        for rule in rules {
            let namespace = registry
                .get(rule.namespace)
                .ok_or_else(|| CacheError::UnknownNamespace(rule.namespace.to_string()))?;
            if rule.scope_field.is_some() && namespace.scope().is_none() {
                return Err(CacheError::registry(format!(
                    "rule for `{}` scopes namespace `{}`, which declares no scope parameter",
                    rule.resource, rule.namespace
                )));
            }
            if let Some(scope) = namespace.scope() {
                scopes.insert(rule.namespace, scope);
            }
            let entry = by_resource.entry(rule.resource).or_default();
            if !entry.contains(&rule) {
                entry.push(rule);
            }
        }
        Ok(Self {
            by_resource,
            scopes,
        })
    }

    /// Rules for the blogging API's write paths.
    pub fn blog(registry: &NamespaceRegistry) -> Result<Self, CacheError> {
        Self::new(blog_rules(), registry)
    }

    pub fn rules_for(&self, resource: &str) -> Result<&[InvalidationRule], CacheError> {
        self.by_resource
            .get(resource)
            .map(Vec::as_slice)
            .ok_or_else(|| CacheError::UnknownResource(resource.to_string()))
    }

    /// Scope parameter of a namespace targeted by some rule.
    pub(crate) fn scope_param(&self, namespace: &str) -> Option<&'static str> {
        self.scopes.get(namespace).copied()
    }

    pub fn resources(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.by_resource.keys().copied()
    }
}

fn blog_rules() -> Vec<InvalidationRule> {
    use InvalidationRule as Rule;
    use registry::{
        ARTICLE, ARTICLE_LIST, FEATURED, TAG_LIST, TRENDING, USER_ARTICLE_LIST, USER_PROFILE,
    };
    use resources as r;

    vec![
        Rule::scoped(r::ARTICLE, ARTICLE, "slug"),
        Rule::purge(r::ARTICLE, ARTICLE_LIST),
        Rule::scoped(r::ARTICLE, USER_ARTICLE_LIST, "author"),
        Rule::purge(r::ARTICLE, TRENDING),
        Rule::purge(r::ARTICLE, FEATURED),
        // Tag counts change when an article is tagged or untagged.
        Rule::purge(r::ARTICLE, TAG_LIST),
        Rule::scoped(r::COMMENT, ARTICLE, "slug"),
        Rule::purge(r::COMMENT, ARTICLE_LIST),
        Rule::purge(r::COMMENT, TRENDING),
        Rule::scoped(r::LIKE, ARTICLE, "slug"),
        Rule::purge(r::LIKE, ARTICLE_LIST),
        Rule::purge(r::LIKE, TRENDING),
        Rule::purge(r::LIKE, FEATURED),
        Rule::purge(r::TAG, TAG_LIST),
        Rule::purge(r::TAG, ARTICLE_LIST),
        Rule::scoped(r::USER, USER_PROFILE, "wallet"),
        Rule::scoped(r::USER, USER_ARTICLE_LIST, "wallet"),
        Rule::scoped(r::SUBSCRIPTION, USER_PROFILE, "wallet"),
    ]
}
