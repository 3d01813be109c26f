//! In-process transport connecting several buses in one process.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, trace};
use uuid::Uuid;

use super::{ChannelContext, ChannelError, MessageChannel, MessageConsumer, OutputMessage};
use crate::health::{ComponentHealth, HealthStatus, Severity};
use crate::sync::lock::{rw_read, rw_write};

const SOURCE: &str = "channel::loopback";

type Subscribers = Vec<(Uuid, Arc<dyn MessageConsumer>)>;

/// Shared medium of a group of [`LoopbackChannel`]s.
///
/// Every message sent on one channel is delivered, on the sender's thread, to
/// the subscribers of every other channel of the hub.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    subscribers: Arc<RwLock<Subscribers>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new member channel with its own node id.
    pub fn channel(&self) -> LoopbackChannel {
        LoopbackChannel {
            id: Uuid::new_v4(),
            hub: self.clone(),
            active: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            sent: AtomicU64::new(0),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        rw_read(&self.subscribers, SOURCE, "subscriber_count").len()
    }

    fn deliver(&self, from: Uuid, message: &OutputMessage) -> usize {
        let targets: Vec<Arc<dyn MessageConsumer>> = rw_read(&self.subscribers, SOURCE, "deliver")
            .iter()
            .filter(|(member, _)| *member != from)
            .map(|(_, consumer)| Arc::clone(consumer))
            .collect();
        for consumer in &targets {
            consumer.accept(message.hash, message.body.clone());
        }
        targets.len()
    }
}

/// One member of a [`LoopbackHub`].
pub struct LoopbackChannel {
    id: Uuid,
    hub: LoopbackHub,
    active: AtomicBool,
    closed: AtomicBool,
    connected: AtomicBool,
    sent: AtomicU64,
}

impl LoopbackChannel {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Simulate losing or regaining the connection to the hub.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Number of messages successfully handed to the hub.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }
}

impl MessageChannel for LoopbackChannel {
    fn activate(&self, context: ChannelContext) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        self.active.store(true, Ordering::SeqCst);
        debug!(
            target_module = SOURCE,
            channel = %self.id,
            node = %context.node_id,
            "Loopback channel activated"
        );
        Ok(())
    }

    fn send(&self, message: &OutputMessage) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        if !self.active.load(Ordering::SeqCst) {
            return Err(ChannelError::NotActive);
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ChannelError::connectivity("loopback hub unreachable"));
        }

        let delivered = self.hub.deliver(self.id, message);
        self.sent.fetch_add(1, Ordering::SeqCst);
        trace!(
            target_module = SOURCE,
            channel = %self.id,
            hash = message.hash,
            delivered,
            "Loopback message delivered"
        );
        Ok(())
    }

    fn subscribe(&self, consumer: Arc<dyn MessageConsumer>) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        rw_write(&self.hub.subscribers, SOURCE, "subscribe").push((self.id, consumer));
        Ok(())
    }

    fn close(&self) -> Result<(), ChannelError> {
        self.closed.store(true, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
        rw_write(&self.hub.subscribers, SOURCE, "close").retain(|(member, _)| *member != self.id);
        Ok(())
    }

    fn health(&self) -> ComponentHealth {
        if self.closed.load(Ordering::SeqCst) {
            ComponentHealth::down("loopback channel closed")
        } else if !self.active.load(Ordering::SeqCst) {
            ComponentHealth::new(HealthStatus::UpNotReady)
        } else if !self.connected.load(Ordering::SeqCst) {
            ComponentHealth::up().with_note(Severity::Warning, "loopback hub unreachable")
        } else {
            ComponentHealth::up()
        }
    }
}
