//! Cache error taxonomy.
//!
//! `CacheError` covers programmer errors that surface synchronously while
//! building keys, TTLs, patterns, or the registry. `StoreError` covers
//! backend failures, which never cross the cache boundary: the adapter
//! absorbs them according to its failure policy.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("unknown cache namespace `{0}`")]
    UnknownNamespace(String),
    #[error("invalid cache namespace `{name}`: {reason}")]
    InvalidNamespace { name: String, reason: &'static str },
    #[error("parameter `{param}` is not declared by namespace `{namespace}`")]
    UnknownParam { namespace: String, param: String },
    #[error("parameter `{param}` is not a primitive value")]
    UnserializableParam { param: String },
    #[error("ttl must be between 1 and {max} seconds, got {0}", max = super::store::MAX_TTL_SECS)]
    InvalidTtl(u64),
    #[error("invalid invalidation pattern `{pattern}`: {reason}")]
    InvalidPattern {
        pattern: String,
        reason: &'static str,
    },
    #[error("no invalidation rules registered for resource `{0}`")]
    UnknownResource(String),
    #[error("invalid namespace registry: {0}")]
    Registry(String),
}

impl CacheError {
    pub(crate) fn invalid_namespace(name: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidNamespace {
            name: name.into(),
            reason,
        }
    }

    pub(crate) fn invalid_pattern(pattern: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidPattern {
            pattern: pattern.into(),
            reason,
        }
    }

    pub(crate) fn registry(message: impl Into<String>) -> Self {
        Self::Registry(message.into())
    }
}

/// Failure reported by a cache backend.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("cache store unavailable: {0}")]
    Unavailable(String),
    #[error("cache store operation failed: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    /// Stable label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::Backend(_) => "backend",
        }
    }
}
