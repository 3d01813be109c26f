use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use super::recovery::RecoveryRole;
use crate::sync::lock::mutex_lock;

const SOURCE: &str = "channel::state";

/// Recovery and failure counters of the message channel.
///
/// Written by the recovery processor, read by health aggregation.
#[derive(Debug, Default)]
pub struct ChannelState {
    producers_in_recovery: AtomicUsize,
    consumers_in_recovery: AtomicUsize,
    unrecoverable_producers: AtomicUsize,
    unrecoverable_consumers: AtomicUsize,
    interrupted_workers: AtomicUsize,
    frequent_starvation: AtomicBool,
    last_recovery_end: Mutex<Option<Instant>>,
}

/// Point-in-time copy of [`ChannelState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelStateSnapshot {
    pub producers_in_recovery: usize,
    pub consumers_in_recovery: usize,
    pub unrecoverable_producers: usize,
    pub unrecoverable_consumers: usize,
    pub interrupted_workers: usize,
    pub frequent_starvation: bool,
}

impl ChannelState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ChannelStateSnapshot {
        ChannelStateSnapshot {
            producers_in_recovery: self.producers_in_recovery.load(Ordering::Acquire),
            consumers_in_recovery: self.consumers_in_recovery.load(Ordering::Acquire),
            unrecoverable_producers: self.unrecoverable_producers.load(Ordering::Acquire),
            unrecoverable_consumers: self.unrecoverable_consumers.load(Ordering::Acquire),
            interrupted_workers: self.interrupted_workers.load(Ordering::Acquire),
            frequent_starvation: self.frequent_starvation.load(Ordering::Acquire),
        }
    }

    pub fn unrecoverable(&self, role: RecoveryRole) -> usize {
        self.unrecoverable_counter(role).load(Ordering::Acquire)
    }

    pub fn in_recovery(&self, role: RecoveryRole) -> usize {
        self.recovery_counter(role).load(Ordering::Acquire)
    }

    /// A recovery starting within `window` of the previous one's end marks
    /// the channel as frequently starved; a later one clears the mark.
    pub(crate) fn enter_recovery(&self, role: RecoveryRole, window: Duration) {
        self.recovery_counter(role).fetch_add(1, Ordering::AcqRel);
        let flapping = mutex_lock(&self.last_recovery_end, SOURCE, "enter_recovery")
            .is_some_and(|ended| ended.elapsed() < window);
        self.frequent_starvation.store(flapping, Ordering::Release);
    }

    pub(crate) fn leave_recovery(&self, role: RecoveryRole) {
        *mutex_lock(&self.last_recovery_end, SOURCE, "leave_recovery") = Some(Instant::now());
        self.recovery_counter(role).fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn mark_unrecoverable(&self, role: RecoveryRole) {
        self.unrecoverable_counter(role).fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn record_interrupted(&self) {
        self.interrupted_workers.fetch_add(1, Ordering::AcqRel);
    }

    fn recovery_counter(&self, role: RecoveryRole) -> &AtomicUsize {
        match role {
            RecoveryRole::Producer => &self.producers_in_recovery,
            RecoveryRole::Consumer => &self.consumers_in_recovery,
        }
    }

    fn unrecoverable_counter(&self, role: RecoveryRole) -> &AtomicUsize {
        match role {
            RecoveryRole::Producer => &self.unrecoverable_producers,
            RecoveryRole::Consumer => &self.unrecoverable_consumers,
        }
    }
}
