//! Per-cache propagation settings.
//!
//! Every cache the bus propagates for has one immutable [`CacheConfig`]. It
//! names the cache, picks the propagation policy, lists invalidation aliases
//! and optionally enables timestamp conflict resolution.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::event::EventType;

// Default values for timestamp comparison
const DEFAULT_PROBABLE_ELEMENT_COUNT: usize = 10_000;
const DEFAULT_TIMESTAMP_EXPIRATION: Duration = Duration::from_secs(300);

/// How changes of a cache reach the other nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheType {
    /// Remote nodes drop the key; values never travel.
    Invalidated,
    /// Remote nodes apply the new value through a conditional merge.
    Replicated,
}

impl CacheType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Invalidated => "invalidated",
            Self::Replicated => "replicated",
        }
    }

    /// Whether wire messages for this cache carry old and new values.
    pub const fn includes_values(self) -> bool {
        matches!(self, Self::Replicated)
    }

    /// Whether events of `event_type` are worth sending for this cache type.
    ///
    /// Additions and expirations do not make a remote copy stale, so
    /// invalidated caches keep them local.
    pub const fn propagates(self, event_type: EventType) -> bool {
        match self {
            Self::Replicated => true,
            Self::Invalidated => matches!(event_type, EventType::Updated | EventType::Evicted),
        }
    }
}

impl std::str::FromStr for CacheType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "invalidated" => Ok(Self::Invalidated),
            "replicated" => Ok(Self::Replicated),
            other => Err(format!("unknown cache type `{other}`")),
        }
    }
}

/// Parameters of timestamp conflict resolution for one cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampComparison {
    /// Record count above which cleanup may run.
    pub probable_element_count: usize,
    /// Records older than this are purged by cleanup.
    pub expiration: Duration,
}

impl Default for TimestampComparison {
    fn default() -> Self {
        Self {
            probable_element_count: DEFAULT_PROBABLE_ELEMENT_COUNT,
            expiration: DEFAULT_TIMESTAMP_EXPIRATION,
        }
    }
}

/// Immutable propagation settings of one cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    name: String,
    cache_type: CacheType,
    aliases: Vec<String>,
    timestamp: Option<TimestampComparison>,
}

impl CacheConfig {
    pub fn builder(name: impl Into<String>, cache_type: CacheType) -> CacheConfigBuilder {
        CacheConfigBuilder {
            name: name.into(),
            cache_type,
            aliases: Vec::new(),
            timestamp: None,
        }
    }

    pub fn invalidated(name: impl Into<String>) -> CacheConfigBuilder {
        Self::builder(name, CacheType::Invalidated)
    }

    pub fn replicated(name: impl Into<String>) -> CacheConfigBuilder {
        Self::builder(name, CacheType::Replicated)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cache_type(&self) -> CacheType {
        self.cache_type
    }

    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    pub fn timestamp(&self) -> Option<&TimestampComparison> {
        self.timestamp.as_ref()
    }

    pub fn uses_timestamp(&self) -> bool {
        self.timestamp.is_some()
    }
}

pub struct CacheConfigBuilder {
    name: String,
    cache_type: CacheType,
    aliases: Vec<String>,
    timestamp: Option<TimestampComparison>,
}

impl CacheConfigBuilder {
    /// Add a cache that receives the invalidation of every event of this one.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases.extend(aliases.into_iter().map(Into::into));
        self
    }

    /// Enable timestamp conflict resolution.
    pub fn timestamp(mut self, comparison: TimestampComparison) -> Self {
        self.timestamp = Some(comparison);
        self
    }

    /// Validate the settings that depend on this cache alone.
    ///
    /// Rules spanning several caches are checked when the bus configuration
    /// is built.
    pub fn build(self) -> Result<CacheConfig, ConfigError> {
        let name = self.name.trim().to_owned();
        if name.is_empty() {
            return Err(ConfigError::EmptyCacheName);
        }

        if self.cache_type == CacheType::Replicated && !self.aliases.is_empty() {
            return Err(ConfigError::AliasOnReplicated { cache: name });
        }

        let mut aliases: Vec<String> = Vec::with_capacity(self.aliases.len());
        for alias in self.aliases {
            let alias = alias.trim().to_owned();
            let reason = if alias.is_empty() {
                Some("alias must not be empty")
            } else if alias == name {
                Some("alias must differ from the cache name")
            } else if aliases.contains(&alias) {
                Some("alias is listed twice")
            } else {
                None
            };
            if let Some(reason) = reason {
                return Err(ConfigError::InvalidAlias {
                    cache: name,
                    alias,
                    reason,
                });
            }
            aliases.push(alias);
        }

        if let Some(timestamp) = &self.timestamp {
            if timestamp.probable_element_count == 0 {
                return Err(ConfigError::InvalidTimestamp {
                    cache: name,
                    reason: "probable element count must be positive",
                });
            }
            if timestamp.expiration.is_zero() {
                return Err(ConfigError::InvalidTimestamp {
                    cache: name,
                    reason: "expiration must be positive",
                });
            }
        }

        Ok(CacheConfig {
            name,
            cache_type: self.cache_type,
            aliases,
            timestamp: self.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalidated_caches_filter_additions_and_expirations() {
        let policy = CacheType::Invalidated;
        assert!(!policy.propagates(EventType::Added));
        assert!(!policy.propagates(EventType::Expired));
        assert!(policy.propagates(EventType::Updated));
        assert!(policy.propagates(EventType::Evicted));
        assert!(!policy.includes_values());
    }

    #[test]
    fn replicated_caches_propagate_everything() {
        let policy = CacheType::Replicated;
        for event_type in [
            EventType::Added,
            EventType::Updated,
            EventType::Evicted,
            EventType::Expired,
        ] {
            assert!(policy.propagates(event_type));
        }
        assert!(policy.includes_values());
    }

    #[test]
    fn replicated_cache_rejects_aliases() {
        let err = CacheConfig::replicated("users")
            .alias("people")
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::AliasOnReplicated { .. }));
    }

    #[test]
    fn alias_must_differ_from_own_name() {
        let err = CacheConfig::invalidated("users")
            .alias("users")
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAlias { .. }));
    }

    #[test]
    fn duplicate_alias_is_rejected() {
        let err = CacheConfig::invalidated("users")
            .aliases(["a", "a"])
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAlias { .. }));
    }

    #[test]
    fn blank_name_is_rejected() {
        let err = CacheConfig::invalidated("  ").build().unwrap_err();
        assert!(matches!(err, ConfigError::EmptyCacheName));
    }

    #[test]
    fn zero_expiration_is_rejected() {
        let err = CacheConfig::replicated("users")
            .timestamp(TimestampComparison {
                probable_element_count: 10,
                expiration: Duration::ZERO,
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTimestamp { .. }));
    }

    #[test]
    fn builds_with_trimmed_aliases_and_timestamp() {
        let config = CacheConfig::invalidated("users")
            .aliases([" people ", "members"])
            .timestamp(TimestampComparison::default())
            .build()
            .expect("valid config");

        assert_eq!(config.name(), "users");
        assert_eq!(config.aliases(), ["people", "members"]);
        assert!(config.uses_timestamp());
        assert_eq!(
            config.timestamp().map(|ts| ts.probable_element_count),
            Some(10_000)
        );
    }

    #[test]
    fn cache_type_parses_case_insensitively() {
        assert_eq!("REPLICATED".parse::<CacheType>(), Ok(CacheType::Replicated));
        assert_eq!(" invalidated".parse::<CacheType>(), Ok(CacheType::Invalidated));
        assert!("mirrored".parse::<CacheType>().is_err());
    }
}
