//! Validated, immutable bus configuration.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::buffer::DEFAULT_RING_CAPACITY;
use crate::cache::{CacheConfig, CacheType};
use crate::channel::RecoverySettings;
use crate::error::ConfigError;
use crate::timestamp::TimestampStoreSettings;

const DEFAULT_BROKEN_WORKER_THRESHOLD: usize = 1;

/// Threading model of the producer or the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Work runs on the calling thread.
    #[default]
    Sync,
    /// Work is routed by hash to one of `stripes` ring buffers, each drained
    /// by its own worker thread.
    Striped { stripes: usize, capacity: usize },
}

impl DispatchMode {
    pub fn striped(stripes: usize) -> Self {
        Self::Striped {
            stripes,
            capacity: DEFAULT_RING_CAPACITY,
        }
    }

    fn validate(self, component: &'static str) -> Result<(), ConfigError> {
        match self {
            Self::Sync => Ok(()),
            Self::Striped { stripes, .. } if !stripes.is_power_of_two() => {
                Err(ConfigError::InvalidStripes { component, stripes })
            }
            Self::Striped { capacity, .. } if !capacity.is_power_of_two() => {
                Err(ConfigError::InvalidCapacity { component, capacity })
            }
            Self::Striped { .. } => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    caches: HashMap<String, Arc<CacheConfig>>,
    alias_owners: HashMap<String, Arc<CacheConfig>>,
    producer: DispatchMode,
    consumer: DispatchMode,
    recovery: RecoverySettings,
    timestamp_store: TimestampStoreSettings,
    broken_worker_threshold: usize,
}

impl BusConfig {
    pub fn builder() -> BusConfigBuilder {
        BusConfigBuilder::default()
    }

    /// Configuration of the cache called exactly `name`.
    pub fn cache(&self, name: &str) -> Option<&Arc<CacheConfig>> {
        self.caches.get(name)
    }

    /// Configuration of the cache that declares `alias`.
    pub fn alias_owner(&self, alias: &str) -> Option<&Arc<CacheConfig>> {
        self.alias_owners.get(alias)
    }

    pub fn caches(&self) -> impl Iterator<Item = &Arc<CacheConfig>> {
        self.caches.values()
    }

    pub fn producer(&self) -> DispatchMode {
        self.producer
    }

    pub fn consumer(&self) -> DispatchMode {
        self.consumer
    }

    pub fn recovery(&self) -> &RecoverySettings {
        &self.recovery
    }

    pub fn timestamp_store(&self) -> &TimestampStoreSettings {
        &self.timestamp_store
    }

    pub fn broken_worker_threshold(&self) -> usize {
        self.broken_worker_threshold
    }
}

pub struct BusConfigBuilder {
    caches: Vec<CacheConfig>,
    producer: DispatchMode,
    consumer: DispatchMode,
    recovery: RecoverySettings,
    timestamp_store: TimestampStoreSettings,
    broken_worker_threshold: usize,
}

impl Default for BusConfigBuilder {
    fn default() -> Self {
        Self {
            caches: Vec::new(),
            producer: DispatchMode::Sync,
            consumer: DispatchMode::Sync,
            recovery: RecoverySettings::default(),
            timestamp_store: TimestampStoreSettings::default(),
            broken_worker_threshold: DEFAULT_BROKEN_WORKER_THRESHOLD,
        }
    }
}

impl BusConfigBuilder {
    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.caches.push(cache);
        self
    }

    pub fn caches(mut self, caches: impl IntoIterator<Item = CacheConfig>) -> Self {
        self.caches.extend(caches);
        self
    }

    pub fn producer(mut self, mode: DispatchMode) -> Self {
        self.producer = mode;
        self
    }

    pub fn consumer(mut self, mode: DispatchMode) -> Self {
        self.consumer = mode;
        self
    }

    pub fn recovery(mut self, settings: RecoverySettings) -> Self {
        self.recovery = settings;
        self
    }

    pub fn timestamp_store(mut self, settings: TimestampStoreSettings) -> Self {
        self.timestamp_store = settings;
        self
    }

    pub fn broken_worker_threshold(mut self, threshold: usize) -> Self {
        self.broken_worker_threshold = threshold;
        self
    }

    /// Check rules spanning several caches and index the result.
    pub fn build(self) -> Result<BusConfig, ConfigError> {
        self.producer.validate("producer")?;
        self.consumer.validate("consumer")?;
        self.recovery.validate()?;
        if self.broken_worker_threshold == 0 {
            return Err(ConfigError::InvalidWorkerThreshold);
        }

        let mut caches: HashMap<String, Arc<CacheConfig>> = HashMap::with_capacity(self.caches.len());
        for cache in self.caches {
            let name = cache.name().to_owned();
            if caches.insert(name.clone(), Arc::new(cache)).is_some() {
                return Err(ConfigError::DuplicateCache { name });
            }
        }

        let mut alias_owners: HashMap<String, Arc<CacheConfig>> = HashMap::new();
        let mut seen = HashSet::new();
        for cache in caches.values() {
            for alias in cache.aliases() {
                if !seen.insert(alias.as_str()) {
                    return Err(ConfigError::invalid_alias(
                        cache.name(),
                        alias,
                        "alias is already declared by another cache",
                    ));
                }
                if let Some(target) = caches.get(alias)
                    && target.cache_type() != CacheType::Invalidated
                {
                    return Err(ConfigError::invalid_alias(
                        cache.name(),
                        alias,
                        "aliased cache is configured and not invalidated",
                    ));
                }
                alias_owners.insert(alias.clone(), Arc::clone(cache));
            }
        }

        Ok(BusConfig {
            caches,
            alias_owners,
            producer: self.producer,
            consumer: self.consumer,
            recovery: self.recovery,
            timestamp_store: self.timestamp_store,
            broken_worker_threshold: self.broken_worker_threshold,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invalidated(name: &str) -> CacheConfig {
        CacheConfig::invalidated(name).build().expect("valid cache")
    }

    #[test]
    fn defaults_are_sync_with_threshold_one() {
        let config = BusConfig::builder().build().expect("empty config is valid");
        assert_eq!(config.producer(), DispatchMode::Sync);
        assert_eq!(config.consumer(), DispatchMode::Sync);
        assert_eq!(config.broken_worker_threshold(), 1);
        assert_eq!(config.recovery().multiplier, 3.0);
    }

    #[test]
    fn duplicate_cache_names_are_rejected() {
        let err = BusConfig::builder()
            .cache(invalidated("users"))
            .cache(invalidated("users"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateCache { name } if name == "users"));
    }

    #[test]
    fn alias_shared_by_two_caches_is_rejected() {
        let err = BusConfig::builder()
            .cache(CacheConfig::invalidated("a").alias("shared").build().unwrap())
            .cache(CacheConfig::invalidated("b").alias("shared").build().unwrap())
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAlias { .. }));
    }

    #[test]
    fn alias_onto_replicated_cache_is_rejected() {
        let err = BusConfig::builder()
            .cache(CacheConfig::invalidated("a").alias("b").build().unwrap())
            .cache(CacheConfig::replicated("b").build().unwrap())
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAlias { .. }));
    }

    #[test]
    fn alias_onto_invalidated_cache_is_allowed_and_indexed() {
        let config = BusConfig::builder()
            .cache(CacheConfig::invalidated("a").alias("b").build().unwrap())
            .cache(invalidated("b"))
            .build()
            .expect("alias onto invalidated cache");

        assert_eq!(config.alias_owner("b").map(|cache| cache.name()), Some("a"));
        assert!(config.cache("b").is_some());
        assert!(config.alias_owner("a").is_none());
    }

    #[test]
    fn striped_modes_need_power_of_two_shapes() {
        let err = BusConfig::builder()
            .producer(DispatchMode::striped(6))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidStripes { component: "producer", stripes: 6 }));

        let err = BusConfig::builder()
            .consumer(DispatchMode::Striped { stripes: 4, capacity: 1000 })
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidCapacity { component: "consumer", .. }));
    }

    #[test]
    fn zero_worker_threshold_is_rejected() {
        let err = BusConfig::builder()
            .broken_worker_threshold(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidWorkerThreshold));
    }
}
