use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use metrics::counter;
use tracing::{debug, trace, warn};

use super::config::BusConfig;
use crate::cache::{CacheConfig, CacheManager, CacheType};
use crate::codec::EventConverter;
use crate::event::{ApplyOutcome, CacheEntryEvent, apply_event};
use crate::telemetry::BusMetric;
use crate::timestamp::TimestampStore;

const SOURCE: &str = "bus::shared";

/// Lifecycle of a bus. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Lifecycle {
    Created = 0,
    Started = 1,
    Stopped = 2,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Started,
            _ => Self::Stopped,
        }
    }
}

/// State shared by the orchestrator and the consumers.
///
/// Holds everything the send filter and the receive path need, so consumers
/// can run receive without a handle on the bus that owns them.
pub(crate) struct BusCore {
    config: BusConfig,
    caches: Arc<dyn CacheManager>,
    converter: Arc<dyn EventConverter>,
    timestamps: TimestampStore,
    lifecycle: AtomicU8,
}

impl BusCore {
    pub(crate) fn new(config: BusConfig, caches: Arc<dyn CacheManager>, converter: Arc<dyn EventConverter>) -> Self {
        let timestamps = TimestampStore::new(*config.timestamp_store());
        Self {
            config,
            caches,
            converter,
            timestamps,
            lifecycle: AtomicU8::new(Lifecycle::Created as u8),
        }
    }

    pub(crate) fn config(&self) -> &BusConfig {
        &self.config
    }

    pub(crate) fn caches(&self) -> &Arc<dyn CacheManager> {
        &self.caches
    }

    pub(crate) fn converter(&self) -> &Arc<dyn EventConverter> {
        &self.converter
    }

    pub(crate) fn timestamps(&self) -> &TimestampStore {
        &self.timestamps
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    pub(crate) fn is_started(&self) -> bool {
        self.lifecycle() == Lifecycle::Started
    }

    /// Move from `from` to `to`, returning the state found on failure.
    pub(crate) fn transition(&self, from: Lifecycle, to: Lifecycle) -> Result<(), Lifecycle> {
        self.lifecycle
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(Lifecycle::from_u8)
    }

    /// Decide whether a local event leaves this node.
    ///
    /// Returns the cache configuration to produce with, or `None` when the
    /// event stays local.
    pub(crate) fn outbound_config(&self, event: &CacheEntryEvent) -> Option<Arc<CacheConfig>> {
        if !self.is_started() {
            trace!(target_module = SOURCE, cache = %event.cache_name(), "Bus not started, event not sent");
            return None;
        }
        let config = self.config.cache(event.cache_name())?;

        if event.origin().is_remote() {
            counter!(BusMetric::EventsSuppressed.id(), "cache" => config.name().to_owned()).increment(1);
            trace!(
                target_module = SOURCE,
                cache = %config.name(),
                key = %event.key(),
                "Remote-origin event not re-sent"
            );
            return None;
        }

        if let Some(comparison) = config.timestamp() {
            self.timestamps.save(event, comparison);
        }

        if !config.cache_type().propagates(event.event_type()) {
            counter!(BusMetric::EventsFiltered.id(), "cache" => config.name().to_owned()).increment(1);
            trace!(
                target_module = SOURCE,
                cache = %config.name(),
                event_type = %event.event_type(),
                "Event type not propagated for cache type"
            );
            return None;
        }

        Some(Arc::clone(config))
    }

    /// Receive path: decode, resolve conflicts, apply, fan out to aliases.
    pub(crate) fn receive(&self, body: &[u8]) {
        if !self.is_started() {
            trace!(target_module = SOURCE, "Bus not started, message ignored");
            return;
        }
        counter!(BusMetric::EventsReceived.id()).increment(1);

        let event = match self.converter.from_binary(body) {
            Ok(event) => event,
            Err(err) => {
                counter!(BusMetric::DecodeErrors.id()).increment(1);
                warn!(
                    target_module = SOURCE,
                    error = %err,
                    bytes = body.len(),
                    "Dropping undecodable message"
                );
                return;
            }
        };

        let Some(config) = self.config.cache(event.cache_name()) else {
            debug!(
                target_module = SOURCE,
                cache = %event.cache_name(),
                "No configuration for received cache, message ignored"
            );
            return;
        };

        if !self.apply(config, &event) {
            return;
        }
        for alias in config.aliases() {
            self.apply_to_cache(alias, CacheType::Invalidated, &event);
        }
    }

    /// Returns `false` when the event was stale and nothing was applied.
    fn apply(&self, config: &CacheConfig, event: &CacheEntryEvent) -> bool {
        if let Some(comparison) = config.timestamp()
            && !self.timestamps.save(event, comparison)
        {
            counter!(BusMetric::StaleEvents.id(), "cache" => config.name().to_owned()).increment(1);
            debug!(
                target_module = SOURCE,
                cache = %config.name(),
                key = %event.key(),
                event_time = %event.event_time(),
                "Stale event skipped"
            );
            return false;
        }
        self.apply_to_cache(config.name(), config.cache_type(), event);
        true
    }

    fn apply_to_cache(&self, cache_name: &str, policy: CacheType, event: &CacheEntryEvent) {
        let Some(cache) = self.caches.cache(cache_name) else {
            debug!(
                target_module = SOURCE,
                cache = %cache_name,
                "Local cache not found, event not applied"
            );
            return;
        };

        match apply_event(policy, cache.as_ref(), event) {
            ApplyOutcome::Failed => {
                counter!(BusMetric::ApplyFailures.id(), "cache" => cache_name.to_owned()).increment(1);
            }
            _ => {
                counter!(BusMetric::EventsApplied.id(), "cache" => cache_name.to_owned()).increment(1);
            }
        }
    }
}
