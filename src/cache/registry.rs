//! Namespace registry.
//!
//! The set of cacheable resource families is fixed at startup. Each
//! namespace declares its parameters (so omitted ones can be normalized), an
//! optional scope parameter used for targeted purges, and a default TTL.
//! Configuration may only override TTLs before the registry is shared.

use std::collections::{BTreeMap, BTreeSet};

use super::error::CacheError;
use super::store::Ttl;

pub const ARTICLE: &str = "article";
pub const ARTICLE_LIST: &str = "article-list";
pub const USER_ARTICLE_LIST: &str = "user-article-list";
pub const TAG_LIST: &str = "tag-list";
pub const TRENDING: &str = "trending";
pub const FEATURED: &str = "featured";
pub const USER_PROFILE: &str = "user-profile";

const DEFAULT_TTL: Ttl = Ttl::seconds(300);
const TAG_LIST_TTL: Ttl = Ttl::seconds(600);
const TRENDING_TTL: Ttl = Ttl::seconds(60);

/// A registered key namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    name: &'static str,
    params: &'static [&'static str],
    scope: Option<&'static str>,
    default_ttl: Ttl,
}

impl Namespace {
    pub const fn new(name: &'static str, params: &'static [&'static str], default_ttl: Ttl) -> Self {
        Self {
            name,
            params,
            scope: None,
            default_ttl,
        }
    }

    /// Place `param` first in every key so that per-scope purges are prefixes.
    pub const fn scoped_by(mut self, param: &'static str) -> Self {
        self.scope = Some(param);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn params(&self) -> &'static [&'static str] {
        self.params
    }

    pub fn scope(&self) -> Option<&'static str> {
        self.scope
    }

    pub fn default_ttl(&self) -> Ttl {
        self.default_ttl
    }

    pub fn declares(&self, param: &str) -> bool {
        self.params.contains(&param)
    }
}

/// Immutable namespace lookup shared by the key builder and the invalidator.
#[derive(Debug, Clone)]
pub struct NamespaceRegistry {
    namespaces: BTreeMap<&'static str, Namespace>,
}

impl NamespaceRegistry {
    /// Validate and index a set of namespaces.
    pub fn new(namespaces: impl IntoIterator<Item = Namespace>) -> Result<Self, CacheError> {
        let mut indexed = BTreeMap::new();
        for namespace in namespaces {
            validate_namespace(&namespace)?;
            if indexed.insert(namespace.name, namespace.clone()).is_some() {
                return Err(CacheError::registry(format!(
                    "namespace `{}` registered twice",
                    namespace.name
                )));
            }
        }
        Ok(Self {
            namespaces: indexed,
        })
    }

    /// Namespaces used by the blogging API.
    pub fn blog() -> Self {
        Self {
            namespaces: blog_namespaces()
                .into_iter()
                .map(|namespace| (namespace.name, namespace))
                .collect(),
        }
    }

    /// Replace default TTLs from deployment configuration.
    pub fn with_ttl_overrides(
        mut self,
        overrides: &BTreeMap<String, u64>,
    ) -> Result<Self, CacheError> {
        for (name, secs) in overrides {
            let namespace = self
                .namespaces
                .get_mut(name.as_str())
                .ok_or_else(|| CacheError::UnknownNamespace(name.clone()))?;
            namespace.default_ttl = Ttl::from_secs(*secs)?;
        }
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&Namespace> {
        self.namespaces.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.namespaces.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Namespace> {
        self.namespaces.values()
    }

    pub fn len(&self) -> usize {
        self.namespaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }
}

fn blog_namespaces() -> Vec<Namespace> {
    vec![
        Namespace::new(ARTICLE, &["slug"], DEFAULT_TTL).scoped_by("slug"),
        Namespace::new(
            ARTICLE_LIST,
            &["limit", "page", "search", "status", "tag"],
            DEFAULT_TTL,
        ),
        Namespace::new(USER_ARTICLE_LIST, &["author", "limit", "page"], DEFAULT_TTL)
            .scoped_by("author"),
        Namespace::new(TAG_LIST, &[], TAG_LIST_TTL),
        Namespace::new(TRENDING, &["limit"], TRENDING_TTL),
        Namespace::new(FEATURED, &["limit"], DEFAULT_TTL),
        Namespace::new(USER_PROFILE, &["wallet"], DEFAULT_TTL).scoped_by("wallet"),
    ]
}

fn validate_namespace(namespace: &Namespace) -> Result<(), CacheError> {
    validate_identifier(namespace.name)?;

    let mut seen = BTreeSet::new();
    for param in namespace.params {
        if param.is_empty() || param.contains([':', '=']) {
            return Err(CacheError::registry(format!(
                "namespace `{}` declares invalid parameter `{param}`",
                namespace.name
            )));
        }
        if !seen.insert(*param) {
            return Err(CacheError::registry(format!(
                "namespace `{}` declares parameter `{param}` twice",
                namespace.name
            )));
        }
    }

    if let Some(scope) = namespace.scope
        && !namespace.declares(scope)
    {
        return Err(CacheError::registry(format!(
            "namespace `{}` is scoped by undeclared parameter `{scope}`",
            namespace.name
        )));
    }

    Ok(())
}

/// Namespace names are lowercase identifiers without separators.
pub(crate) fn validate_identifier(name: &str) -> Result<(), CacheError> {
    if name.is_empty() {
        return Err(CacheError::invalid_namespace(name, "must not be empty"));
    }
    if !name
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' || ch == '_')
    {
        return Err(CacheError::invalid_namespace(
            name,
            "only lowercase ascii letters, digits, `-` and `_` are allowed",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blog_registry_passes_validation() {
        let validated = NamespaceRegistry::new(blog_namespaces()).expect("valid registry");
        assert_eq!(validated.len(), NamespaceRegistry::blog().len());
        assert!(validated.contains(ARTICLE_LIST));
    }

    #[test]
    fn blog_registry_ttls() {
        let registry = NamespaceRegistry::blog();
        let ttl = |name: &str| registry.get(name).expect("namespace").default_ttl().as_secs();
        assert_eq!(ttl(ARTICLE_LIST), 300);
        assert_eq!(ttl(TAG_LIST), 600);
        assert_eq!(ttl(TRENDING), 60);
        assert!(ttl(TRENDING) < ttl(TAG_LIST));
    }

    #[test]
    fn duplicate_namespace_is_rejected() {
        let err = NamespaceRegistry::new([
            Namespace::new("tag-list", &[], DEFAULT_TTL),
            Namespace::new("tag-list", &[], TAG_LIST_TTL),
        ])
        .expect_err("duplicate");
        assert!(matches!(err, CacheError::Registry(_)));
    }

    #[test]
    fn scope_must_be_declared() {
        let err = NamespaceRegistry::new([
            Namespace::new("drafts", &["page"], DEFAULT_TTL).scoped_by("author")
        ])
        .expect_err("undeclared scope");
        assert!(matches!(err, CacheError::Registry(_)));
    }

    #[test]
    fn identifiers_reject_separators() {
        assert!(validate_identifier("article-list").is_ok());
        assert!(validate_identifier("user_profile2").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("articles:list").is_err());
        assert!(validate_identifier("Articles").is_err());
    }

    #[test]
    fn ttl_overrides_apply_to_known_namespaces_only() {
        let overrides = BTreeMap::from([(TRENDING.to_string(), 15)]);
        let registry = NamespaceRegistry::blog()
            .with_ttl_overrides(&overrides)
            .expect("override");
        assert_eq!(
            registry.get(TRENDING).expect("trending").default_ttl().as_secs(),
            15
        );

        let unknown = BTreeMap::from([("drafts".to_string(), 15)]);
        assert_eq!(
            NamespaceRegistry::blog()
                .with_ttl_overrides(&unknown)
                .expect_err("unknown"),
            CacheError::UnknownNamespace("drafts".to_string())
        );

        let zero = BTreeMap::from([(TRENDING.to_string(), 0)]);
        assert_eq!(
            NamespaceRegistry::blog()
                .with_ttl_overrides(&zero)
                .expect_err("zero ttl"),
            CacheError::InvalidTtl(0)
        );
    }
}
