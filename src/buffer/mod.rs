//! Partitioned blocking queues and their worker threads.
//!
//! A [`StripedRingBuffer`] routes each item to one of a power-of-two number
//! of [`RingBuffer`] stripes by its routing hash. Items with the same hash
//! always land on the same stripe, and each stripe is drained by exactly one
//! worker, so per-key order survives the hand-off between threads.

mod ring;
mod workers;

use metrics::gauge;

use crate::error::ConfigError;
use crate::telemetry::BusMetric;

pub use ring::{BufferClosed, RingBuffer};
pub(crate) use workers::{StripeWorkers, WorkerVerdict};

/// Ring capacity used when none is configured.
pub const DEFAULT_RING_CAPACITY: usize = 1024;

pub struct StripedRingBuffer<T> {
    component: &'static str,
    stripes: Box<[RingBuffer<T>]>,
    mask: u64,
}

impl<T> StripedRingBuffer<T> {
    /// Both `stripes` and `capacity` must be positive powers of two.
    pub fn new(component: &'static str, stripes: usize, capacity: usize) -> Result<Self, ConfigError> {
        if !stripes.is_power_of_two() {
            return Err(ConfigError::InvalidStripes { component, stripes });
        }
        if !capacity.is_power_of_two() {
            return Err(ConfigError::InvalidCapacity { component, capacity });
        }
        Ok(Self {
            component,
            stripes: (0..stripes).map(|_| RingBuffer::new(capacity)).collect(),
            mask: stripes as u64 - 1,
        })
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    /// Stripe that items with `hash` are routed to.
    pub fn stripe_for(&self, hash: u64) -> usize {
        (hash & self.mask) as usize
    }

    /// Offer `item` to the stripe of `hash`; see [`RingBuffer::offer`].
    pub fn offer(&self, hash: u64, item: T) -> Result<bool, BufferClosed> {
        let stripe = self.stripe_for(hash);
        let ring = &self.stripes[stripe];
        let full = ring.offer(item)?;
        self.publish_cursors(stripe, ring);
        Ok(full)
    }

    pub fn poll(&self, stripe: usize) -> Result<T, BufferClosed> {
        let ring = self.stripes.get(stripe).ok_or(BufferClosed)?;
        let item = ring.poll()?;
        self.publish_cursors(stripe, ring);
        Ok(item)
    }

    /// `(read, write)` cursors of one stripe.
    pub fn cursors(&self, stripe: usize) -> Option<(u64, u64)> {
        self.stripes.get(stripe).map(RingBuffer::cursors)
    }

    pub fn close_stripe(&self, stripe: usize) {
        if let Some(ring) = self.stripes.get(stripe) {
            ring.close();
        }
    }

    pub fn close(&self) {
        for ring in self.stripes.iter() {
            ring.close();
        }
    }

    fn publish_cursors(&self, stripe: usize, ring: &RingBuffer<T>) {
        let (read, write) = ring.cursors();
        let stripe = stripe.to_string();
        gauge!(
            BusMetric::RingReadCursor.id(),
            "component" => self.component,
            "stripe" => stripe.clone()
        )
        .set(read as f64);
        gauge!(
            BusMetric::RingWriteCursor.id(),
            "component" => self.component,
            "stripe" => stripe
        )
        .set(write as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EntryKey, routing_hash};

    #[test]
    fn rejects_non_power_of_two_shapes() {
        assert!(matches!(
            StripedRingBuffer::<u8>::new("producer", 3, 8),
            Err(ConfigError::InvalidStripes { stripes: 3, .. })
        ));
        assert!(matches!(
            StripedRingBuffer::<u8>::new("producer", 4, 0),
            Err(ConfigError::InvalidCapacity { capacity: 0, .. })
        ));
    }

    #[test]
    fn routing_is_deterministic_for_a_key() {
        let buffer = StripedRingBuffer::<u8>::new("consumer", 8, 4).unwrap();
        let hash = routing_hash("users", &EntryKey::key("alice"));
        let stripe = buffer.stripe_for(hash);

        assert_eq!(stripe, (hash & 7) as usize);
        for _ in 0..10 {
            assert_eq!(buffer.stripe_for(routing_hash("users", &EntryKey::key("alice"))), stripe);
        }
    }

    #[test]
    fn items_with_one_hash_stay_ordered_on_one_stripe() {
        let buffer = StripedRingBuffer::new("producer", 4, 16).unwrap();
        for value in 0..10_u32 {
            buffer.offer(42, value).unwrap();
        }
        let stripe = buffer.stripe_for(42);
        let drained: Vec<u32> = (0..10).map(|_| buffer.poll(stripe).unwrap()).collect();

        assert_eq!(drained, (0..10).collect::<Vec<_>>());
        assert_eq!(buffer.cursors(stripe), Some((10, 10)));
    }

    #[test]
    fn closing_one_stripe_leaves_others_open() {
        let buffer = StripedRingBuffer::new("producer", 2, 4).unwrap();
        buffer.close_stripe(0);

        assert_eq!(buffer.offer(0, 1_u8), Err(BufferClosed));
        assert_eq!(buffer.offer(1, 2_u8), Ok(false));
    }
}
