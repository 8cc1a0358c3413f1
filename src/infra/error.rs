use thiserror::Error;

use crate::cache::{CacheError, StoreError};
use crate::config::LoadError;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("configuration error: {0}")]
    Configuration(#[from] LoadError),
    #[error("cache setup failed: {0}")]
    Cache(#[from] CacheError),
    #[error("cache backend setup failed: {0}")]
    Store(#[from] StoreError),
}

impl InfraError {
    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}
