//! Inbound side of the bus: channel messages to the receive path.

use std::sync::Arc;

use bytes::Bytes;
use metrics::counter;
use tracing::debug;

use crate::buffer::{StripeWorkers, StripedRingBuffer, WorkerVerdict};
use crate::bus::BusCore;
use crate::channel::{ChannelState, MessageConsumer, RecoveryRole};
use crate::error::BusError;
use crate::health::{ComponentHealth, worker_health};
use crate::telemetry::BusMetric;

const SOURCE: &str = "consumer";

/// A [`MessageConsumer`] the bus can report on and stop.
pub trait Consumer: MessageConsumer {
    fn health(&self) -> ComponentHealth;

    fn stop(&self);
}

/// Runs the receive path on the channel's delivery thread.
pub struct SyncConsumer {
    core: Arc<BusCore>,
    state: Arc<ChannelState>,
    broken_worker_threshold: usize,
}

impl SyncConsumer {
    pub(crate) fn new(core: Arc<BusCore>, state: Arc<ChannelState>, broken_worker_threshold: usize) -> Self {
        Self {
            core,
            state,
            broken_worker_threshold,
        }
    }
}

impl MessageConsumer for SyncConsumer {
    fn accept(&self, _hash: u64, body: Bytes) {
        self.core.receive(&body);
    }
}

impl Consumer for SyncConsumer {
    fn health(&self) -> ComponentHealth {
        worker_health(
            RecoveryRole::Consumer.as_str(),
            self.state.unrecoverable(RecoveryRole::Consumer),
            self.broken_worker_threshold,
        )
    }

    fn stop(&self) {}
}

/// Hands each message to the worker of its hash's stripe.
///
/// Messages with the same hash are received in delivery order.
pub struct StripedConsumer {
    workers: StripeWorkers<Bytes>,
    state: Arc<ChannelState>,
    broken_worker_threshold: usize,
}

impl StripedConsumer {
    pub(crate) fn spawn(
        core: Arc<BusCore>,
        state: Arc<ChannelState>,
        broken_worker_threshold: usize,
        stripes: usize,
        capacity: usize,
    ) -> Result<Self, BusError> {
        let buffer = StripedRingBuffer::new("consumer", stripes, capacity)?;
        let workers = StripeWorkers::spawn("consumer", buffer, move |_stripe, body: Bytes| {
            core.receive(&body);
            WorkerVerdict::Continue
        })
        .map_err(|err| BusError::spawn("consumer", err))?;

        Ok(Self {
            workers,
            state,
            broken_worker_threshold,
        })
    }
}

impl MessageConsumer for StripedConsumer {
    fn accept(&self, hash: u64, body: Bytes) {
        match self.workers.offer(hash, body) {
            Ok(true) => {
                counter!(BusMetric::RingBufferFull.id(), "component" => "consumer").increment(1);
            }
            Ok(false) => {}
            Err(_) => {
                counter!(BusMetric::DroppedMessages.id(), "component" => "consumer").increment(1);
                debug!(target_module = SOURCE, hash, "Consumer stripe closed, message dropped");
            }
        }
    }
}

impl Consumer for StripedConsumer {
    fn health(&self) -> ComponentHealth {
        let failed = self.state.unrecoverable(RecoveryRole::Consumer) + self.workers.failed_workers();
        worker_health(RecoveryRole::Consumer.as_str(), failed, self.broken_worker_threshold)
    }

    fn stop(&self) {
        self.workers.shutdown();
    }
}
