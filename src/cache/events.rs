//! Committed writes, as seen by invalidation.

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use super::error::CacheError;
use super::keys::{ParamValue, QueryParams};

/// Identifying fields of a write (`slug`, `author`, `wallet`, ...).
///
/// Absent and `null` fields are equivalent; both widen the purge to the
/// whole namespace.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvalidationContext {
    fields: QueryParams,
}

impl InvalidationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.fields.insert(field, value);
        self
    }

    /// Build a context from a serializable write payload.
    pub fn from_serializable<T: Serialize>(write: &T) -> Result<Self, CacheError> {
        Ok(Self {
            fields: QueryParams::from_serializable(write)?,
        })
    }

    /// The usable value of `field`, if any.
    pub fn get(&self, field: &str) -> Option<&ParamValue> {
        self.fields
            .get(field)
            .filter(|value| !matches!(value, ParamValue::Null))
    }
}

/// A write that has been committed to the primary store.
#[derive(Debug, Clone)]
pub struct WriteEvent {
    /// Unique identifier, used to drop duplicate deliveries.
    pub id: Uuid,
    pub resource: String,
    pub context: InvalidationContext,
    pub occurred_at: OffsetDateTime,
}

impl WriteEvent {
    pub fn new(resource: impl Into<String>, context: InvalidationContext) -> Self {
        Self {
            id: Uuid::new_v4(),
            resource: resource.into(),
            context,
            occurred_at: OffsetDateTime::now_utc(),
        }
    }
}
