//! Configuration layer: typed settings with layered precedence (file → env).

use std::{path::Path, str::FromStr, time::Duration};

use config::{Config, ConfigBuilder, Environment, File, builder::DefaultState};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::buffer::DEFAULT_RING_CAPACITY;
use crate::bus::{BusConfig, DispatchMode};
use crate::cache::{CacheConfig, CacheType, TimestampComparison};
use crate::channel::RecoverySettings;
use crate::error::ConfigError;
use crate::timestamp::TimestampStoreSettings;

const LOCAL_CONFIG_BASENAME: &str = "cachebus";
const ENV_PREFIX: &str = "CACHEBUS";

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub bus: BusConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("invalid bus configuration: {0}")]
    Bus(#[from] ConfigError),
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment).
///
/// `cachebus.toml` in the working directory is read when present. An
/// explicit `config_file` must exist. `CACHEBUS__*` environment variables
/// override both, with `__` separating nested keys.
pub fn load(config_file: Option<&Path>) -> Result<Settings, LoadError> {
    let mut builder = Config::builder().add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));
    load_from(builder)
}

fn load_from(builder: ConfigBuilder<DefaultState>) -> Result<Settings, LoadError> {
    let raw: RawSettings = builder.build()?.try_deserialize()?;
    Settings::from_raw(raw)
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let logging = build_logging_settings(raw.logging)?;

        let mut caches = Vec::with_capacity(raw.caches.len());
        for (index, cache) in raw.caches.into_iter().enumerate() {
            caches.push(build_cache_config(index, cache)?);
        }

        let mut bus = BusConfig::builder()
            .caches(caches)
            .producer(build_dispatch_mode("producer.mode", raw.producer)?)
            .consumer(build_dispatch_mode("consumer.mode", raw.consumer)?)
            .recovery(build_recovery_settings(raw.recovery))
            .timestamp_store(build_timestamp_store_settings(raw.timestamps));
        if let Some(threshold) = raw.health.broken_worker_threshold {
            bus = bus.broken_worker_threshold(threshold);
        }

        Ok(Self {
            logging,
            bus: bus.build()?,
        })
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

fn build_cache_config(index: usize, cache: RawCacheSettings) -> Result<CacheConfig, LoadError> {
    let name = cache
        .name
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| LoadError::invalid("caches.name", format!("cache #{index} has no name")))?;

    let cache_type = match cache.cache_type {
        Some(value) => CacheType::from_str(&value)
            .map_err(|reason| LoadError::invalid("caches.type", format!("cache `{name}`: {reason}")))?,
        None => {
            return Err(LoadError::invalid(
                "caches.type",
                format!("cache `{name}` must set `invalidated` or `replicated`"),
            ));
        }
    };

    let mut builder = CacheConfig::builder(name.as_str(), cache_type).aliases(cache.aliases);
    if cache.use_timestamp {
        let Some(timestamp) = cache.timestamp else {
            return Err(ConfigError::MissingTimestamp { cache: name }.into());
        };
        let defaults = TimestampComparison::default();
        builder = builder.timestamp(TimestampComparison {
            probable_element_count: timestamp
                .probable_element_count
                .unwrap_or(defaults.probable_element_count),
            expiration: timestamp
                .expiration_seconds
                .map_or(defaults.expiration, Duration::from_secs),
        });
    }

    Ok(builder.build()?)
}

fn build_dispatch_mode(key: &'static str, raw: RawDispatchSettings) -> Result<DispatchMode, LoadError> {
    match raw.mode.as_deref().map(str::trim) {
        None | Some("sync") => Ok(DispatchMode::Sync),
        Some("striped") => Ok(DispatchMode::Striped {
            stripes: raw.stripes.unwrap_or(DEFAULT_STRIPES),
            capacity: raw.capacity.unwrap_or(DEFAULT_RING_CAPACITY),
        }),
        Some(other) => Err(LoadError::invalid(
            key,
            format!("unknown mode `{other}`, expected `sync` or `striped`"),
        )),
    }
}

const DEFAULT_STRIPES: usize = 4;

fn build_recovery_settings(recovery: RawRecoverySettings) -> RecoverySettings {
    let defaults = RecoverySettings::default();
    RecoverySettings {
        initial_backoff: recovery
            .initial_backoff_ms
            .map_or(defaults.initial_backoff, Duration::from_millis),
        multiplier: recovery.multiplier.unwrap_or(defaults.multiplier),
        max_backoff: recovery
            .max_backoff_ms
            .map_or(defaults.max_backoff, Duration::from_millis),
        max_recovery_time: recovery
            .max_recovery_seconds
            .map_or(defaults.max_recovery_time, Duration::from_secs),
        jitter: recovery.jitter.unwrap_or(defaults.jitter),
    }
}

fn build_timestamp_store_settings(timestamps: RawTimestampStoreSettings) -> TimestampStoreSettings {
    let defaults = TimestampStoreSettings::default();
    TimestampStoreSettings {
        async_cleanup: timestamps.async_cleanup.unwrap_or(defaults.async_cleanup),
        cleanup_interval: timestamps
            .cleanup_interval_seconds
            .map_or(defaults.cleanup_interval, Duration::from_secs),
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    caches: Vec<RawCacheSettings>,
    producer: RawDispatchSettings,
    consumer: RawDispatchSettings,
    recovery: RawRecoverySettings,
    timestamps: RawTimestampStoreSettings,
    health: RawHealthSettings,
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
    name: Option<String>,
    #[serde(rename = "type")]
    cache_type: Option<String>,
    aliases: Vec<String>,
    use_timestamp: bool,
    timestamp: Option<RawTimestampSettings>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawTimestampSettings {
    probable_element_count: Option<usize>,
    expiration_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDispatchSettings {
    mode: Option<String>,
    stripes: Option<usize>,
    capacity: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRecoverySettings {
    initial_backoff_ms: Option<u64>,
    multiplier: Option<f64>,
    max_backoff_ms: Option<u64>,
    max_recovery_seconds: Option<u64>,
    jitter: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawTimestampStoreSettings {
    async_cleanup: Option<bool>,
    cleanup_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawHealthSettings {
    broken_worker_threshold: Option<usize>,
}
