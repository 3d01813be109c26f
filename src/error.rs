//! Errors returned synchronously by bus construction and lifecycle calls.
//!
//! Steady-state failures on the send and receive paths never surface here;
//! they are logged and counted where they happen.

use thiserror::Error;

use crate::channel::ChannelError;

/// Invalid bus or cache configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cache name must not be empty")]
    EmptyCacheName,
    #[error("cache `{name}` is configured more than once")]
    DuplicateCache { name: String },
    #[error("replicated cache `{cache}` cannot declare aliases")]
    AliasOnReplicated { cache: String },
    #[error("alias `{alias}` of cache `{cache}` is invalid: {reason}")]
    InvalidAlias {
        cache: String,
        alias: String,
        reason: &'static str,
    },
    #[error("cache `{cache}` enables timestamp comparison without its parameters")]
    MissingTimestamp { cache: String },
    #[error("timestamp comparison of cache `{cache}` is invalid: {reason}")]
    InvalidTimestamp { cache: String, reason: &'static str },
    #[error("{component} stripe count {stripes} must be a positive power of two")]
    InvalidStripes {
        component: &'static str,
        stripes: usize,
    },
    #[error("{component} ring capacity {capacity} must be a positive power of two")]
    InvalidCapacity {
        component: &'static str,
        capacity: usize,
    },
    #[error("recovery settings are invalid: {reason}")]
    InvalidRecovery { reason: &'static str },
    #[error("broken worker threshold must be at least 1")]
    InvalidWorkerThreshold,
    #[error("no message channel was provided")]
    MissingChannel,
    #[error("no cache manager was provided")]
    MissingCacheManager,
}

impl ConfigError {
    pub(crate) fn invalid_alias(cache: &str, alias: &str, reason: &'static str) -> Self {
        Self::InvalidAlias {
            cache: cache.to_owned(),
            alias: alias.to_owned(),
            reason,
        }
    }
}

/// Failures of [`CacheBus`](crate::bus::CacheBus) construction and lifecycle.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("cache bus is already started")]
    AlreadyStarted,
    #[error("cache bus is not started")]
    NotStarted,
    #[error("cache bus is already stopped")]
    AlreadyStopped,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("message channel failed to activate: {0}")]
    Channel(#[from] ChannelError),
    #[error("failed to spawn {role} worker thread: {source}")]
    Spawn {
        role: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl BusError {
    pub(crate) fn spawn(role: &'static str, source: std::io::Error) -> Self {
        Self::Spawn { role, source }
    }
}
