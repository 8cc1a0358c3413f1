//! Cache key construction.
//!
//! Keys have the shape `namespace:name=value:name=value`. Parameter names are
//! sorted, the namespace scope parameter (if any) leads, and declared
//! parameters that the caller omitted are rendered with an empty value, so
//! the same logical query always yields the same bytes.
//!
//! The namespace and the scope segment are always followed by `:`, which is
//! what lets `namespace:*` and `namespace:scope=value:*` select whole
//! segments and nothing else.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use super::error::CacheError;
use super::registry::{NamespaceRegistry, validate_identifier};

const SEGMENT_SEPARATOR: char = ':';
const VALUE_SEPARATOR: char = '=';
const WILDCARD: char = '*';
const ROOT_PARAM: &str = "<root>";

/// A primitive query parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
}

impl ParamValue {
    fn render(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Bool(value) => value.to_string(),
            Self::Int(value) => value.to_string(),
            Self::UInt(value) => value.to_string(),
            // -0.0 and 0.0 are the same query
            Self::Float(value) if *value == 0.0 => 0.0_f64.to_string(),
            Self::Float(value) => value.to_string(),
            Self::Str(value) => escape_component(value),
        }
    }
}

impl TryFrom<&Value> for ParamValue {
    type Error = ();

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        match value {
            Value::Null => Ok(Self::Null),
            Value::Bool(b) => Ok(Self::Bool(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Self::Int(i))
                } else if let Some(u) = n.as_u64() {
                    Ok(Self::UInt(u))
                } else {
                    n.as_f64().map(Self::Float).ok_or(())
                }
            }
            Value::String(s) => Ok(Self::Str(s.clone())),
            Value::Array(_) | Value::Object(_) => Err(()),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for ParamValue {
    fn from(value: u32) -> Self {
        Self::UInt(value.into())
    }
}

impl From<u64> for ParamValue {
    fn from(value: u64) -> Self {
        Self::UInt(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl<T: Into<ParamValue>> From<Option<T>> for ParamValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Query parameters for a cache key. Insertion order is irrelevant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryParams {
    values: BTreeMap<String, ParamValue>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Build params from a JSON object whose values are all primitives.
    pub fn from_json(value: &Value) -> Result<Self, CacheError> {
        match value {
            Value::Null => Ok(Self::new()),
            Value::Object(map) => {
                let mut params = Self::new();
                for (name, raw) in map {
                    let value = ParamValue::try_from(raw).map_err(|_| {
                        CacheError::UnserializableParam {
                            param: name.clone(),
                        }
                    })?;
                    params.values.insert(name.clone(), value);
                }
                Ok(params)
            }
            _ => Err(CacheError::UnserializableParam {
                param: ROOT_PARAM.to_string(),
            }),
        }
    }

    /// Build params from a serializable query struct such as a request's
    /// pagination/filter parameters.
    pub fn from_serializable<T: Serialize>(query: &T) -> Result<Self, CacheError> {
        let value = serde_json::to_value(query).map_err(|_| CacheError::UnserializableParam {
            param: ROOT_PARAM.to_string(),
        })?;
        Self::from_json(&value)
    }
}

impl<K, V> FromIterator<(K, V)> for QueryParams
where
    K: Into<String>,
    V: Into<ParamValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Self::new();
        for (name, value) in iter {
            params.insert(name, value);
        }
        params
    }
}

/// A fully-built cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// The namespace segment of the key.
    pub fn namespace(&self) -> &str {
        self.0
            .split_once(SEGMENT_SEPARATOR)
            .map_or(self.0.as_str(), |(namespace, _)| namespace)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A prefix pattern with exactly one trailing wildcard, e.g. `article-list:*`
/// or `user-article-list:author=0xabc:*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyPattern(String);

impl KeyPattern {
    /// Parse and validate a pattern string.
    pub fn parse(pattern: &str) -> Result<Self, CacheError> {
        let Some(prefix) = pattern.strip_suffix(WILDCARD) else {
            return Err(CacheError::invalid_pattern(
                pattern,
                "pattern must end with a single `*`",
            ));
        };
        if !prefix.ends_with(SEGMENT_SEPARATOR) {
            return Err(CacheError::invalid_pattern(
                pattern,
                "wildcard must follow a `:` segment boundary",
            ));
        }
        if prefix.contains(['*', '?', '[', ']', '\\']) {
            return Err(CacheError::invalid_pattern(
                pattern,
                "only a single trailing wildcard is supported",
            ));
        }
        let namespace = prefix
            .split_once(SEGMENT_SEPARATOR)
            .map_or(prefix, |(namespace, _)| namespace);
        validate_identifier(namespace)?;
        Ok(Self(pattern.to_string()))
    }

    /// Every key of a namespace.
    pub fn namespace(namespace: &str) -> Result<Self, CacheError> {
        validate_identifier(namespace)?;
        Ok(Self(format!("{namespace}{SEGMENT_SEPARATOR}{WILDCARD}")))
    }

    /// Keys of a namespace whose leading scope segment equals `value`.
    pub fn scoped(namespace: &str, scope: &str, value: &ParamValue) -> Result<Self, CacheError> {
        validate_identifier(namespace)?;
        Ok(Self(format!(
            "{namespace}{SEGMENT_SEPARATOR}{}{VALUE_SEPARATOR}{}{SEGMENT_SEPARATOR}{WILDCARD}",
            escape_component(scope),
            value.render()
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The literal prefix every matching key starts with.
    pub fn prefix(&self) -> &str {
        &self.0[..self.0.len() - WILDCARD.len_utf8()]
    }

    pub fn namespace_name(&self) -> &str {
        let prefix = self.prefix();
        prefix
            .split_once(SEGMENT_SEPARATOR)
            .map_or(prefix, |(namespace, _)| namespace)
    }

    /// True when this pattern purges its whole namespace.
    pub fn is_namespace_wide(&self) -> bool {
        self.prefix().len() == self.namespace_name().len() + SEGMENT_SEPARATOR.len_utf8()
    }

    pub fn matches(&self, key: &str) -> bool {
        key.starts_with(self.prefix())
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives cache keys from a namespace and its query parameters.
#[derive(Clone)]
pub struct KeyBuilder {
    registry: Arc<NamespaceRegistry>,
    strict: bool,
}

impl KeyBuilder {
    pub fn new(registry: Arc<NamespaceRegistry>, strict: bool) -> Self {
        Self { registry, strict }
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn registry(&self) -> &Arc<NamespaceRegistry> {
        &self.registry
    }

    /// Build the key for `namespace` and `params`.
    pub fn build(&self, namespace: &str, params: &QueryParams) -> Result<CacheKey, CacheError> {
        validate_identifier(namespace)?;

        let (scope, mut names) = match self.registry.get(namespace) {
            Some(entry) => {
                if self.strict
                    && let Some(undeclared) = params.names().find(|name| !entry.declares(name))
                {
                    return Err(CacheError::UnknownParam {
                        namespace: namespace.to_string(),
                        param: undeclared.to_string(),
                    });
                }
                let names: BTreeSet<&str> = entry
                    .params()
                    .iter()
                    .copied()
                    .chain(params.names())
                    .collect();
                (entry.scope(), names)
            }
            None if self.strict => {
                return Err(CacheError::UnknownNamespace(namespace.to_string()));
            }
            None => (None, params.names().collect()),
        };

        let mut key = format!("{namespace}{SEGMENT_SEPARATOR}");
        if let Some(scope) = scope {
            names.remove(scope);
            key.push_str(&segment(scope, params.get(scope)));
            key.push(SEGMENT_SEPARATOR);
        }
        let rest: Vec<String> = names
            .into_iter()
            .map(|name| segment(name, params.get(name)))
            .collect();
        key.push_str(&rest.join(":"));

        Ok(CacheKey(key))
    }
}

fn segment(name: &str, value: Option<&ParamValue>) -> String {
    let rendered = value.map(ParamValue::render).unwrap_or_default();
    format!("{}{VALUE_SEPARATOR}{rendered}", escape_component(name))
}

/// Percent-escape separators and glob metacharacters.
fn escape_component(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '%' | ':' | '=' | '*' | '?' | '[' | ']' | '\\' => {
                escaped.push_str(&format!("%{:02X}", ch as u32));
            }
            _ => escaped.push(ch),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn builder(strict: bool) -> KeyBuilder {
        KeyBuilder::new(Arc::new(NamespaceRegistry::blog()), strict)
    }

    #[test]
    fn parameter_order_does_not_change_key() {
        let builder = builder(true);
        let forward = QueryParams::new()
            .with("page", 2)
            .with("limit", 10)
            .with("status", "published")
            .with("tag", "rust");
        let backward = QueryParams::new()
            .with("tag", "rust")
            .with("status", "published")
            .with("limit", 10)
            .with("page", 2);

        let a = builder.build("article-list", &forward).expect("key");
        let b = builder.build("article-list", &backward).expect("key");
        assert_eq!(a, b);
        assert_eq!(
            a.as_str(),
            "article-list:limit=10:page=2:search=:status=published:tag=rust"
        );
    }

    #[test]
    fn negative_zero_renders_like_zero() {
        let builder = builder(false);
        let negative = builder
            .build("drafts", &QueryParams::new().with("score", -0.0_f64))
            .expect("key");
        let positive = builder
            .build("drafts", &QueryParams::new().with("score", 0.0_f64))
            .expect("key");

        assert_eq!(negative, positive);
        assert_eq!(negative.as_str(), "drafts:score=0");
    }

    #[test]
    fn missing_declared_params_use_placeholder() {
        let builder = builder(true);
        let key = builder
            .build("article-list", &QueryParams::new().with("page", 1))
            .expect("key");
        assert_eq!(
            key.as_str(),
            "article-list:limit=:page=1:search=:status=:tag="
        );

        let explicit_null = builder
            .build(
                "article-list",
                &QueryParams::new()
                    .with("page", 1)
                    .with("search", Option::<String>::None),
            )
            .expect("key");
        assert_eq!(key, explicit_null);
    }

    #[test]
    fn scope_parameter_leads_the_key() {
        let builder = builder(true);
        let key = builder
            .build(
                "user-article-list",
                &QueryParams::new()
                    .with("page", 1)
                    .with("limit", 5)
                    .with("author", "0xabc"),
            )
            .expect("key");
        assert_eq!(
            key.as_str(),
            "user-article-list:author=0xabc:limit=5:page=1"
        );

        let pattern = KeyPattern::scoped(
            "user-article-list",
            "author",
            &ParamValue::from("0xabc"),
        )
        .expect("pattern");
        assert!(pattern.matches(key.as_str()));
    }

    #[test]
    fn separators_in_values_are_escaped() {
        let builder = builder(true);
        let key = builder
            .build(
                "article-list",
                &QueryParams::new().with("search", "a:b=c%d*"),
            )
            .expect("key");
        assert!(key.as_str().contains("search=a%3Ab%3Dc%25d%2A"));
        assert_eq!(key.as_str().matches(':').count(), 5);
    }

    #[test]
    fn strict_mode_rejects_unknown_namespace_and_params() {
        let builder = builder(true);
        assert_eq!(
            builder.build("drafts", &QueryParams::new()),
            Err(CacheError::UnknownNamespace("drafts".to_string()))
        );
        assert!(matches!(
            builder.build("tag-list", &QueryParams::new().with("page", 1)),
            Err(CacheError::UnknownParam { .. })
        ));
    }

    #[test]
    fn permissive_mode_allows_ad_hoc_namespaces() {
        let builder = builder(false);
        let key = builder
            .build("articles", &QueryParams::new().with("page", 1).with("limit", 10))
            .expect("ad hoc key");
        assert_eq!(key.as_str(), "articles:limit=10:page=1");
        assert_eq!(key.namespace(), "articles");

        assert!(matches!(
            builder.build("bad:name", &QueryParams::new()),
            Err(CacheError::InvalidNamespace { .. })
        ));
    }

    #[test]
    fn nested_json_values_are_rejected() {
        let err = QueryParams::from_json(&json!({ "page": 1, "filter": { "tag": "rust" } }))
            .expect_err("nested object");
        assert_eq!(
            err,
            CacheError::UnserializableParam {
                param: "filter".to_string()
            }
        );

        let err = QueryParams::from_json(&json!({ "tags": ["a", "b"] })).expect_err("array");
        assert!(matches!(err, CacheError::UnserializableParam { .. }));
    }

    #[test]
    fn serializable_query_structs_build_params() {
        #[derive(Serialize)]
        struct ArticleListQuery {
            page: u32,
            limit: u32,
            status: Option<String>,
            tag: Option<String>,
        }

        let params = QueryParams::from_serializable(&ArticleListQuery {
            page: 3,
            limit: 20,
            status: None,
            tag: Some("defi".to_string()),
        })
        .expect("params");

        let key = builder(true).build("article-list", &params).expect("key");
        assert_eq!(
            key.as_str(),
            "article-list:limit=20:page=3:search=:status=:tag=defi"
        );
    }

    #[test]
    fn pattern_validation() {
        assert!(KeyPattern::parse("article-list:*").is_ok());
        assert!(KeyPattern::parse("user-article-list:author=0xabc:*").is_ok());
        assert!(KeyPattern::parse("article-list").is_err());
        assert!(KeyPattern::parse("article-list*").is_err());
        assert!(KeyPattern::parse("article-*:*").is_err());
        assert!(KeyPattern::parse("article-list:page=?:*").is_err());

        let wide = KeyPattern::namespace("tag-list").expect("pattern");
        assert!(wide.is_namespace_wide());
        assert_eq!(wide.prefix(), "tag-list:");
        assert!(wide.matches("tag-list:"));
        assert!(!wide.matches("tag-lists:"));

        let scoped =
            KeyPattern::scoped("article", "slug", &ParamValue::from("hello")).expect("pattern");
        assert!(!scoped.is_namespace_wide());
        assert_eq!(scoped.namespace_name(), "article");
        assert!(scoped.matches("article:slug=hello:"));
        assert!(!scoped.matches("article:slug=hello-world:"));
    }
}
