//! The cache bus orchestrator.
//!
//! [`CacheBus`] owns the configuration and lifecycle, and wires the producer,
//! consumer and channel together:
//!
//! - **Send**: local cache events pass the feedback guard and the per-type
//!   filter, then go to the producer.
//! - **Receive**: channel messages are decoded, conflict-checked, applied to
//!   the local cache and fanned out to aliases.
//! - **Health**: channel, producer, consumer and cache manager health are
//!   aggregated into one [`BusHealth`].

mod config;
mod shared;

use std::sync::{Arc, Mutex, RwLock, Weak};

use metrics::counter;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CacheConfig, CacheListener, CacheManager, ListenerId, LocalCache};
use crate::channel::{
    ChannelContext, ChannelState, MessageChannel, MessageConsumer, RecoveryProcessor, RecoveryRole,
};
use crate::codec::{EventConverter, JsonEventConverter};
use crate::consumer::{Consumer, StripedConsumer, SyncConsumer};
use crate::error::{BusError, ConfigError};
use crate::event::CacheEntryEvent;
use crate::health::{BusHealth, ComponentHealth, HealthStatus, Severity, aggregate};
use crate::producer::{Producer, StripedProducer, SyncProducer};
use crate::sync::ShutdownSignal;
use crate::sync::lock::{mutex_lock, rw_read, rw_write};
use crate::telemetry::BusMetric;

pub use config::{BusConfig, BusConfigBuilder, DispatchMode};
pub(crate) use shared::BusCore;
pub(crate) use shared::Lifecycle;

const SOURCE: &str = "bus";

/// Producer and consumer of a running bus.
struct Pipeline {
    producer: Arc<dyn Producer>,
    consumer: Arc<dyn Consumer>,
}

struct BusInner {
    node_id: Uuid,
    core: Arc<BusCore>,
    channel: Arc<dyn MessageChannel>,
    channel_state: Arc<ChannelState>,
    recovery: Arc<RecoveryProcessor>,
    shutdown: Arc<ShutdownSignal>,
    pipeline: RwLock<Option<Pipeline>>,
    listeners: Mutex<Vec<Registration>>,
}

/// A bus listener installed on one local cache.
struct Registration {
    cache_name: String,
    cache: Arc<dyn LocalCache>,
    id: ListenerId,
}

/// Propagates cache changes between nodes.
///
/// Cheap to clone; clones share one bus.
#[derive(Clone)]
pub struct CacheBus {
    inner: Arc<BusInner>,
}

impl CacheBus {
    pub fn builder(config: BusConfig) -> CacheBusBuilder {
        CacheBusBuilder {
            config,
            channel: None,
            caches: None,
            converter: None,
        }
    }

    /// Identity of this node on the channel.
    pub fn node_id(&self) -> Uuid {
        self.inner.node_id
    }

    pub fn config(&self) -> &BusConfig {
        self.inner.core.config()
    }

    /// Configuration of `name`, looked up by cache name first, then by alias.
    pub fn cache_config(&self, name: &str) -> Option<Arc<CacheConfig>> {
        let config = self.config();
        config.cache(name).or_else(|| config.alias_owner(name)).cloned()
    }

    pub fn is_started(&self) -> bool {
        self.inner.core.is_started()
    }

    pub fn channel_state(&self) -> &ChannelState {
        &self.inner.channel_state
    }

    /// Activate the channel, spawn workers and begin propagating.
    pub fn start(&self) -> Result<(), BusError> {
        match self.inner.core.lifecycle() {
            Lifecycle::Created => {}
            Lifecycle::Started => return Err(BusError::AlreadyStarted),
            Lifecycle::Stopped => return Err(BusError::AlreadyStopped),
        }

        let mut pipeline = rw_write(&self.inner.pipeline, SOURCE, "start");
        if pipeline.is_some() {
            return Err(BusError::AlreadyStarted);
        }

        self.inner.channel.activate(ChannelContext {
            node_id: self.inner.node_id,
            recovery: Arc::clone(&self.inner.recovery),
        })?;

        let built = match self.build_pipeline() {
            Ok(built) => built,
            Err(err) => {
                self.close_channel();
                return Err(err);
            }
        };
        if let Err(err) = self.inner.channel.subscribe(built.subscriber) {
            built.pipeline.consumer.stop();
            built.pipeline.producer.stop();
            self.close_channel();
            return Err(err.into());
        }
        *pipeline = Some(built.pipeline);

        if let Err(found) = self.inner.core.transition(Lifecycle::Created, Lifecycle::Started) {
            warn!(target_module = SOURCE, ?found, "Bus lifecycle changed during start");
            return Err(match found {
                Lifecycle::Stopped => BusError::AlreadyStopped,
                _ => BusError::AlreadyStarted,
            });
        }

        let config = self.config();
        info!(
            target_module = SOURCE,
            node = %self.inner.node_id,
            caches = config.caches().count(),
            producer = ?config.producer(),
            consumer = ?config.consumer(),
            "Cache bus started"
        );
        Ok(())
    }

    /// Stop propagating, join workers, close the channel and forget every
    /// recorded timestamp. Queued events are discarded.
    pub fn stop(&self) -> Result<(), BusError> {
        if let Err(found) = self.inner.core.transition(Lifecycle::Started, Lifecycle::Stopped) {
            return Err(match found {
                Lifecycle::Created => BusError::NotStarted,
                _ => BusError::AlreadyStopped,
            });
        }

        self.inner.shutdown.trigger();
        let pipeline = rw_write(&self.inner.pipeline, SOURCE, "stop").take();
        if let Some(pipeline) = pipeline {
            pipeline.consumer.stop();
            pipeline.producer.stop();
        }
        self.close_channel();
        self.unregister_listeners();
        self.inner.core.timestamps().clear();

        info!(target_module = SOURCE, node = %self.inner.node_id, "Cache bus stopped");
        Ok(())
    }

    /// Propagate a local cache event to the other nodes.
    ///
    /// Does nothing while the bus is not started, for caches without
    /// configuration, and for events whose origin is remote. Failures are
    /// logged and counted, never returned.
    pub fn send(&self, event: CacheEntryEvent) {
        let Some(config) = self.inner.core.outbound_config(&event) else {
            return;
        };
        let producer = match rw_read(&self.inner.pipeline, SOURCE, "send").as_ref() {
            Some(pipeline) => Arc::clone(&pipeline.producer),
            None => return,
        };

        if let Err(err) = producer.produce(&config, event) {
            counter!(BusMetric::ProduceErrors.id(), "cache" => config.name().to_owned()).increment(1);
            warn!(
                target_module = SOURCE,
                cache = %config.name(),
                error = %err,
                "Failed to produce event"
            );
        }
    }

    /// Apply an encoded event received from another node.
    pub fn receive(&self, body: &[u8]) {
        self.inner.core.receive(body);
    }

    /// Listener that forwards a cache's events to this bus.
    ///
    /// Holds the bus weakly, so it never keeps a dropped bus alive.
    pub fn listener(&self) -> Arc<dyn CacheListener> {
        Arc::new(BusListener {
            bus: Arc::downgrade(&self.inner),
        })
    }

    /// Register [`CacheBus::listener`] on every configured cache the cache
    /// manager knows. Registrations are undone by [`CacheBus::stop`].
    ///
    /// Caches that already carry this bus's listener are skipped, and a
    /// stopped bus registers nothing. Returns the number of caches newly
    /// registered.
    pub fn register_listeners(&self) -> usize {
        let caches = self.inner.core.caches();
        let mut registered = mutex_lock(&self.inner.listeners, SOURCE, "register_listeners");
        if self.inner.core.lifecycle() == Lifecycle::Stopped {
            debug!(target_module = SOURCE, "Bus stopped, no listeners registered");
            return 0;
        }
        let mut count = 0;
        for config in self.config().caches() {
            if registered.iter().any(|entry| entry.cache_name == config.name()) {
                continue;
            }
            let Some(cache) = caches.cache(config.name()) else {
                debug!(
                    target_module = SOURCE,
                    cache = %config.name(),
                    "Configured cache not found, no listener registered"
                );
                continue;
            };
            let id = cache.register_listener(self.listener());
            registered.push(Registration {
                cache_name: config.name().to_owned(),
                cache,
                id,
            });
            count += 1;
        }
        count
    }

    /// Aggregate health of the bus and its components.
    pub fn health(&self) -> BusHealth {
        let started = self.is_started();
        let mut components = vec![("channel", self.channel_health())];

        match rw_read(&self.inner.pipeline, SOURCE, "health").as_ref() {
            Some(pipeline) => {
                components.push(("producer", pipeline.producer.health()));
                components.push(("consumer", pipeline.consumer.health()));
            }
            None => {
                components.push(("producer", ComponentHealth::new(HealthStatus::Down)));
                components.push(("consumer", ComponentHealth::new(HealthStatus::Down)));
            }
        }
        components.push(("caches", self.inner.core.caches().health()));

        let status = aggregate(started, components.iter().map(|(_, health)| health));
        BusHealth { status, components }
    }

    fn channel_health(&self) -> ComponentHealth {
        let mut health = self.inner.channel.health();
        let state = self.inner.channel_state.snapshot();
        for (role, count) in [
            (RecoveryRole::Producer, state.producers_in_recovery),
            (RecoveryRole::Consumer, state.consumers_in_recovery),
        ] {
            if count > 0 {
                health = health.with_note(
                    Severity::Warning,
                    format!("{count} {} thread(s) recovering the channel", role.as_str()),
                );
            }
        }
        if state.frequent_starvation {
            health = health.with_note(Severity::Warning, "channel recovers frequently");
        }
        if state.interrupted_workers > 0 {
            health = health.with_note(
                Severity::Info,
                format!("{} recovery loop(s) interrupted by shutdown", state.interrupted_workers),
            );
        }
        health
    }

    fn build_pipeline(&self) -> Result<BuiltPipeline, BusError> {
        let inner = &self.inner;
        let config = inner.core.config();
        let threshold = config.broken_worker_threshold();

        let sync_producer = SyncProducer::new(
            Arc::clone(&inner.channel),
            Arc::clone(inner.core.converter()),
            Arc::clone(&inner.recovery),
            Arc::clone(&inner.channel_state),
            threshold,
        );
        let producer: Arc<dyn Producer> = match config.producer() {
            DispatchMode::Sync => Arc::new(sync_producer),
            DispatchMode::Striped { stripes, capacity } => {
                Arc::new(StripedProducer::spawn(sync_producer, stripes, capacity)?)
            }
        };

        let (consumer, subscriber): (Arc<dyn Consumer>, Arc<dyn MessageConsumer>) = match config.consumer() {
            DispatchMode::Sync => {
                let consumer = Arc::new(SyncConsumer::new(
                    Arc::clone(&inner.core),
                    Arc::clone(&inner.channel_state),
                    threshold,
                ));
                let subscriber: Arc<dyn MessageConsumer> = consumer.clone();
                (consumer as Arc<dyn Consumer>, subscriber)
            }
            DispatchMode::Striped { stripes, capacity } => {
                let spawned = StripedConsumer::spawn(
                    Arc::clone(&inner.core),
                    Arc::clone(&inner.channel_state),
                    threshold,
                    stripes,
                    capacity,
                );
                let consumer = match spawned {
                    Ok(consumer) => Arc::new(consumer),
                    Err(err) => {
                        producer.stop();
                        return Err(err);
                    }
                };
                let subscriber: Arc<dyn MessageConsumer> = consumer.clone();
                (consumer as Arc<dyn Consumer>, subscriber)
            }
        };

        Ok(BuiltPipeline {
            pipeline: Pipeline { producer, consumer },
            subscriber,
        })
    }

    fn unregister_listeners(&self) {
        let registered = std::mem::take(&mut *mutex_lock(&self.inner.listeners, SOURCE, "unregister_listeners"));
        for entry in registered {
            entry.cache.unregister_listener(entry.id);
        }
    }

    fn close_channel(&self) {
        if let Err(err) = self.inner.channel.close() {
            warn!(target_module = SOURCE, error = %err, "Failed to close message channel");
        }
    }
}

struct BuiltPipeline {
    pipeline: Pipeline,
    subscriber: Arc<dyn MessageConsumer>,
}

pub struct CacheBusBuilder {
    config: BusConfig,
    channel: Option<Arc<dyn MessageChannel>>,
    caches: Option<Arc<dyn CacheManager>>,
    converter: Option<Arc<dyn EventConverter>>,
}

impl CacheBusBuilder {
    pub fn channel(mut self, channel: Arc<dyn MessageChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn cache_manager(mut self, caches: Arc<dyn CacheManager>) -> Self {
        self.caches = Some(caches);
        self
    }

    /// Defaults to [`JsonEventConverter`].
    pub fn converter(mut self, converter: Arc<dyn EventConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    pub fn build(self) -> Result<CacheBus, BusError> {
        let channel = self.channel.ok_or(ConfigError::MissingChannel)?;
        let caches = self.caches.ok_or(ConfigError::MissingCacheManager)?;
        let converter = self.converter.unwrap_or_else(|| Arc::new(JsonEventConverter));

        let channel_state = Arc::new(ChannelState::new());
        let shutdown = Arc::new(ShutdownSignal::new());
        let recovery = Arc::new(RecoveryProcessor::new(
            *self.config.recovery(),
            Arc::clone(&channel_state),
            Arc::clone(&shutdown),
        ));

        Ok(CacheBus {
            inner: Arc::new(BusInner {
                node_id: Uuid::new_v4(),
                core: Arc::new(BusCore::new(self.config, caches, converter)),
                channel,
                channel_state,
                recovery,
                shutdown,
                pipeline: RwLock::new(None),
                listeners: Mutex::new(Vec::new()),
            }),
        })
    }
}

/// Forwards cache events to the bus it was created from.
struct BusListener {
    bus: Weak<BusInner>,
}

impl CacheListener for BusListener {
    fn on_event(&self, event: &CacheEntryEvent) {
        if let Some(inner) = self.bus.upgrade() {
            CacheBus { inner }.send(event.clone());
        }
    }
}
