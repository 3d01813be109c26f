//! Outbound side of the bus: events to channel messages.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use thiserror::Error;
use tracing::{trace, warn};

use crate::buffer::{BufferClosed, StripeWorkers, StripedRingBuffer, WorkerVerdict};
use crate::cache::CacheConfig;
use crate::channel::{
    ChannelError, ChannelState, MessageChannel, OutputMessage, RecoveryError, RecoveryProcessor,
    RecoveryRole,
};
use crate::codec::{CodecError, EventConverter};
use crate::error::BusError;
use crate::event::CacheEntryEvent;
use crate::health::{ComponentHealth, worker_health};
use crate::telemetry::BusMetric;

const SOURCE: &str = "producer";

#[derive(Debug, Error)]
pub enum ProduceError {
    #[error(transparent)]
    Encode(#[from] CodecError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    NotRecoverable(RecoveryError),
    #[error("producer was cancelled by shutdown")]
    Cancelled,
    #[error("producer is closed")]
    Closed,
}

impl From<RecoveryError> for ProduceError {
    fn from(err: RecoveryError) -> Self {
        match err {
            RecoveryError::Cancelled => Self::Cancelled,
            err @ RecoveryError::NotRecoverable { .. } => Self::NotRecoverable(err),
        }
    }
}

impl From<BufferClosed> for ProduceError {
    fn from(_: BufferClosed) -> Self {
        Self::Closed
    }
}

/// Turns events into messages on the channel.
pub trait Producer: Send + Sync {
    fn produce(&self, config: &Arc<CacheConfig>, event: CacheEntryEvent) -> Result<(), ProduceError>;

    fn health(&self) -> ComponentHealth;

    /// Release worker threads. Further calls to `produce` fail.
    fn stop(&self);
}

/// Sends on the calling thread.
pub struct SyncProducer {
    channel: Arc<dyn MessageChannel>,
    converter: Arc<dyn EventConverter>,
    recovery: Arc<RecoveryProcessor>,
    state: Arc<ChannelState>,
    broken_worker_threshold: usize,
}

impl SyncProducer {
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        converter: Arc<dyn EventConverter>,
        recovery: Arc<RecoveryProcessor>,
        state: Arc<ChannelState>,
        broken_worker_threshold: usize,
    ) -> Self {
        Self {
            channel,
            converter,
            recovery,
            state,
            broken_worker_threshold,
        }
    }

    fn send(&self, config: &CacheConfig, event: &CacheEntryEvent) -> Result<(), ProduceError> {
        let include_values = config.cache_type().includes_values();
        let body = self.converter.to_binary(event, include_values)?;
        let message = OutputMessage::new(event.hash(), body);

        let started = Instant::now();
        match self.channel.send(&message) {
            Ok(()) => {}
            Err(err) if err.is_connectivity() => {
                warn!(
                    target_module = SOURCE,
                    cache = %config.name(),
                    error = %err,
                    "Channel send lost connectivity, recovering"
                );
                self.recovery.recover(
                    RecoveryRole::Producer,
                    || self.channel.reset_sender(),
                    || self.channel.send(&message),
                )?;
            }
            Err(err) => return Err(err.into()),
        }

        histogram!(BusMetric::ProduceLatency.id()).record(started.elapsed().as_secs_f64() * 1000.0);
        counter!(BusMetric::EventsSent.id(), "cache" => config.name().to_owned()).increment(1);
        trace!(
            target_module = SOURCE,
            cache = %config.name(),
            key = %event.key(),
            event_type = %event.event_type(),
            "Event sent"
        );
        Ok(())
    }
}

impl Producer for SyncProducer {
    fn produce(&self, config: &Arc<CacheConfig>, event: CacheEntryEvent) -> Result<(), ProduceError> {
        self.send(config, &event)
    }

    fn health(&self) -> ComponentHealth {
        worker_health(
            RecoveryRole::Producer.as_str(),
            self.state.unrecoverable(RecoveryRole::Producer),
            self.broken_worker_threshold,
        )
    }

    fn stop(&self) {}
}

type ProduceJob = (Arc<CacheConfig>, CacheEntryEvent);

/// Routes events by hash to per-stripe worker threads that send them.
///
/// Events of one key always share a stripe, so they leave in the order they
/// were produced.
pub struct StripedProducer {
    workers: StripeWorkers<ProduceJob>,
    state: Arc<ChannelState>,
    broken_worker_threshold: usize,
}

impl StripedProducer {
    pub fn spawn(sync: SyncProducer, stripes: usize, capacity: usize) -> Result<Self, BusError> {
        let state = Arc::clone(&sync.state);
        let broken_worker_threshold = sync.broken_worker_threshold;
        let buffer = StripedRingBuffer::new("producer", stripes, capacity)?;

        let workers = StripeWorkers::spawn("producer", buffer, move |stripe, (config, event): ProduceJob| {
            match sync.send(&config, &event) {
                Ok(()) => WorkerVerdict::Continue,
                Err(ProduceError::NotRecoverable(err)) => {
                    warn!(
                        target_module = SOURCE,
                        stripe,
                        error = %err,
                        "Producer stripe lost the channel for good"
                    );
                    WorkerVerdict::Exit
                }
                Err(ProduceError::Cancelled) => WorkerVerdict::Cancelled,
                Err(err) => {
                    warn!(
                        target_module = SOURCE,
                        stripe,
                        cache = %config.name(),
                        error = %err,
                        "Failed to send event"
                    );
                    counter!(BusMetric::ProduceErrors.id(), "cache" => config.name().to_owned()).increment(1);
                    WorkerVerdict::Continue
                }
            }
        })
        .map_err(|err| BusError::spawn("producer", err))?;

        Ok(Self {
            workers,
            state,
            broken_worker_threshold,
        })
    }
}

impl Producer for StripedProducer {
    fn produce(&self, config: &Arc<CacheConfig>, event: CacheEntryEvent) -> Result<(), ProduceError> {
        let hash = event.hash();
        let observed_full = self.workers.offer(hash, (Arc::clone(config), event))?;
        if observed_full {
            counter!(BusMetric::RingBufferFull.id(), "component" => "producer").increment(1);
        }
        Ok(())
    }

    fn health(&self) -> ComponentHealth {
        let failed = self.state.unrecoverable(RecoveryRole::Producer) + self.workers.failed_workers();
        worker_health(RecoveryRole::Producer.as_str(), failed, self.broken_worker_threshold)
    }

    fn stop(&self) {
        self.workers.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use bytes::Bytes;
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::channel::{
        ChannelContext, LoopbackChannel, LoopbackHub, MessageConsumer, RecoverySettings,
    };
    use crate::codec::JsonEventConverter;
    use crate::health::HealthStatus;
    use crate::sync::ShutdownSignal;

    #[derive(Default)]
    struct Inbox {
        events: Mutex<Vec<CacheEntryEvent>>,
    }

    impl MessageConsumer for Inbox {
        fn accept(&self, _hash: u64, body: Bytes) {
            let event = JsonEventConverter.from_binary(&body).expect("decodable message");
            self.events.lock().expect("inbox lock").push(event);
        }
    }

    struct Fixture {
        channel: Arc<LoopbackChannel>,
        inbox: Arc<Inbox>,
        state: Arc<ChannelState>,
        recovery: Arc<RecoveryProcessor>,
    }

    fn fixture(settings: RecoverySettings) -> Fixture {
        let hub = LoopbackHub::new();
        let channel = Arc::new(hub.channel());
        let peer = hub.channel();
        let inbox = Arc::new(Inbox::default());
        peer.subscribe(inbox.clone()).unwrap();

        let state = Arc::new(ChannelState::new());
        let recovery = Arc::new(RecoveryProcessor::new(
            settings,
            Arc::clone(&state),
            Arc::new(ShutdownSignal::new()),
        ));
        channel
            .activate(ChannelContext {
                node_id: Uuid::new_v4(),
                recovery: Arc::clone(&recovery),
            })
            .unwrap();
        Fixture {
            channel,
            inbox,
            state,
            recovery,
        }
    }

    impl Fixture {
        fn sync_producer(&self) -> SyncProducer {
            SyncProducer::new(
                self.channel.clone(),
                Arc::new(JsonEventConverter),
                Arc::clone(&self.recovery),
                Arc::clone(&self.state),
                1,
            )
        }

        fn received(&self) -> Vec<CacheEntryEvent> {
            self.inbox.events.lock().unwrap().clone()
        }
    }

    fn short_recovery() -> RecoverySettings {
        RecoverySettings {
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(10),
            max_recovery_time: Duration::from_millis(50),
            ..RecoverySettings::default()
        }
    }

    #[test]
    fn invalidated_caches_ship_without_values() {
        let fixture = fixture(short_recovery());
        let producer = fixture.sync_producer();
        let config = Arc::new(CacheConfig::invalidated("users").build().unwrap());

        producer
            .produce(&config, CacheEntryEvent::updated("users", "k", json!(1), json!(2)))
            .unwrap();

        let received = fixture.received();
        assert_eq!(received.len(), 1);
        assert!(received[0].new_value().is_none());
    }

    #[test]
    fn replicated_caches_ship_values() {
        let fixture = fixture(short_recovery());
        let producer = fixture.sync_producer();
        let config = Arc::new(CacheConfig::replicated("users").build().unwrap());

        producer
            .produce(&config, CacheEntryEvent::added("users", "k", json!("v")))
            .unwrap();

        assert_eq!(fixture.received()[0].new_value(), Some(&json!("v")));
    }

    #[test]
    fn lost_connectivity_surfaces_not_recoverable_and_breaks_health() {
        let fixture = fixture(short_recovery());
        let producer = fixture.sync_producer();
        let config = Arc::new(CacheConfig::invalidated("users").build().unwrap());
        fixture.channel.set_connected(false);

        let err = producer
            .produce(&config, CacheEntryEvent::evicted("users", "k"))
            .unwrap_err();

        assert!(matches!(err, ProduceError::NotRecoverable(_)));
        assert_eq!(producer.health().status, HealthStatus::UpFatalBroken);
    }

    #[test]
    fn striped_producer_keeps_per_key_order() {
        let fixture = fixture(short_recovery());
        let producer = StripedProducer::spawn(fixture.sync_producer(), 4, 8).unwrap();
        let config = Arc::new(CacheConfig::replicated("users").build().unwrap());

        for seq in 0..200 {
            producer
                .produce(&config, CacheEntryEvent::added("users", "same-key", json!(seq)))
                .unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while fixture.received().len() < 200 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        producer.stop();

        let sequence: Vec<i64> = fixture
            .received()
            .iter()
            .filter_map(|event| event.new_value().and_then(|value| value.as_i64()))
            .collect();
        assert_eq!(sequence, (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn stopped_striped_producer_rejects_events() {
        let fixture = fixture(short_recovery());
        let producer = StripedProducer::spawn(fixture.sync_producer(), 2, 4).unwrap();
        producer.stop();

        let config = Arc::new(CacheConfig::invalidated("users").build().unwrap());
        let err = producer
            .produce(&config, CacheEntryEvent::evicted("users", "k"))
            .unwrap_err();
        assert!(matches!(err, ProduceError::Closed));
    }
}
