//! Configuration layer: typed settings with layered precedence (files → env).

use std::{
    collections::BTreeMap,
    num::NonZeroUsize,
    path::Path,
    str::FromStr,
    time::Duration,
};

use config::{Config, ConfigBuilder, Environment, File, builder::DefaultState};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::config::{
    DEFAULT_KEY_PREFIX, DEFAULT_MEMORY_MAX_ENTRIES, DEFAULT_SHUTDOWN_GRACE_MS, DEFAULT_TTL_SECS,
};
use crate::cache::{BackendKind, Granularity, NamespaceRegistry, Ttl};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "inkwell";
const ENV_PREFIX: &str = "INKWELL";
/// Environment variable naming an extra, required configuration file.
pub const CONFIG_FILE_ENV: &str = "INKWELL_CONFIG_FILE";

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub strict_namespaces: bool,
    pub single_flight: bool,
    pub granularity: Granularity,
    pub default_ttl: Ttl,
    /// Validated against the namespace registry.
    pub ttl_overrides: BTreeMap<String, u64>,
    pub backend: BackendKind,
    pub memory_max_entries: NonZeroUsize,
    pub redis_url: Option<String>,
    pub key_prefix: String,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence:
/// `config/default` → `inkwell` → `config_file` → `INKWELL__*` environment.
pub fn load(config_file: Option<&Path>) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true),
    );

    load_from(builder)
}

/// [`load`] with the extra file taken from `INKWELL_CONFIG_FILE`.
pub fn load_from_env() -> Result<Settings, LoadError> {
    let config_file = std::env::var_os(CONFIG_FILE_ENV);
    load(config_file.as_deref().map(Path::new))
}

fn load_from(builder: ConfigBuilder<DefaultState>) -> Result<Settings, LoadError> {
    let raw: RawSettings = builder.build()?.try_deserialize()?;
    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings { logging, cache } = raw;

        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;

        Ok(Self { logging, cache })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let default_ttl = Ttl::from_secs(cache.default_ttl_secs.unwrap_or(DEFAULT_TTL_SECS))
        .map_err(|err| LoadError::invalid("cache.default_ttl_secs", err.to_string()))?;

    let ttl_overrides = cache.ttl_overrides.unwrap_or_default();
    NamespaceRegistry::blog()
        .with_ttl_overrides(&ttl_overrides)
        .map_err(|err| LoadError::invalid("cache.ttl_overrides", err.to_string()))?;

    let memory_max_entries = non_zero_usize(
        cache
            .memory_max_entries
            .unwrap_or(DEFAULT_MEMORY_MAX_ENTRIES),
        "cache.memory_max_entries",
    )?;

    let backend = cache.backend.unwrap_or_default();
    let redis_url = cache.redis_url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });
    if backend == BackendKind::Redis && redis_url.is_none() {
        return Err(LoadError::invalid(
            "cache.redis_url",
            "required when cache.backend = \"redis\"",
        ));
    }

    let key_prefix = cache
        .key_prefix
        .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string());
    if key_prefix.contains(['*', '?', '[', ']']) {
        return Err(LoadError::invalid(
            "cache.key_prefix",
            "must not contain glob metacharacters",
        ));
    }

    let shutdown_grace_ms = cache
        .shutdown_grace_ms
        .unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS);

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        strict_namespaces: cache.strict_namespaces.unwrap_or(true),
        single_flight: cache.single_flight.unwrap_or(true),
        granularity: cache.granularity.unwrap_or_default(),
        default_ttl,
        ttl_overrides,
        backend,
        memory_max_entries,
        redis_url,
        key_prefix,
        shutdown_grace: Duration::from_millis(shutdown_grace_ms),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    strict_namespaces: Option<bool>,
    single_flight: Option<bool>,
    granularity: Option<Granularity>,
    default_ttl_secs: Option<u64>,
    ttl_overrides: Option<BTreeMap<String, u64>>,
    backend: Option<BackendKind>,
    memory_max_entries: Option<usize>,
    redis_url: Option<String>,
    key_prefix: Option<String>,
    shutdown_grace_ms: Option<u64>,
}

fn non_zero_usize(value: usize, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
