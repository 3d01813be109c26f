use std::sync::{Condvar, Mutex};

use thiserror::Error;

use crate::sync::lock::{condvar_wait, mutex_lock};

const SOURCE: &str = "buffer::ring";

/// Returned by ring operations once the buffer is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("ring buffer is closed")]
pub struct BufferClosed;

struct Slots<T> {
    slots: Box<[Option<T>]>,
    mask: u64,
    read: u64,
    write: u64,
    closed: bool,
}

impl<T> Slots<T> {
    fn is_full(&self) -> bool {
        self.write - self.read > self.mask
    }

    fn is_empty(&self) -> bool {
        self.write == self.read
    }
}

/// Fixed-capacity blocking circular buffer.
///
/// Cursors only grow; a slot index is the cursor masked by `capacity - 1`.
pub struct RingBuffer<T> {
    state: Mutex<Slots<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> RingBuffer<T> {
    /// `capacity` must be a power of two.
    pub(crate) fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        let slots = (0..capacity).map(|_| None).collect::<Vec<_>>().into_boxed_slice();
        Self {
            state: Mutex::new(Slots {
                slots,
                mask: capacity as u64 - 1,
                read: 0,
                write: 0,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "capacity").slots.len()
    }

    /// Append `item`, blocking while the buffer is full.
    ///
    /// Returns whether the buffer was found full, which callers use as a
    /// backpressure signal.
    pub fn offer(&self, item: T) -> Result<bool, BufferClosed> {
        let mut state = mutex_lock(&self.state, SOURCE, "offer");
        let mut observed_full = false;
        loop {
            if state.closed {
                return Err(BufferClosed);
            }
            if !state.is_full() {
                break;
            }
            observed_full = true;
            state = condvar_wait(&self.not_full, state, SOURCE, "offer");
        }

        let index = (state.write & state.mask) as usize;
        state.slots[index] = Some(item);
        state.write += 1;
        drop(state);
        self.not_empty.notify_one();
        Ok(observed_full)
    }

    /// Take the oldest item, blocking while the buffer is empty.
    ///
    /// Items still queued when the buffer closes are discarded.
    pub fn poll(&self) -> Result<T, BufferClosed> {
        let mut state = mutex_lock(&self.state, SOURCE, "poll");
        loop {
            if state.closed {
                return Err(BufferClosed);
            }
            if !state.is_empty() {
                break;
            }
            state = condvar_wait(&self.not_empty, state, SOURCE, "poll");
        }

        let index = (state.read & state.mask) as usize;
        let item = state.slots[index].take();
        state.read += 1;
        drop(state);
        self.not_full.notify_one();
        // A filled slot is never empty between write and read.
        item.ok_or(BufferClosed)
    }

    /// Close the buffer and wake every blocked caller.
    pub fn close(&self) {
        let mut state = mutex_lock(&self.state, SOURCE, "close");
        state.closed = true;
        for slot in state.slots.iter_mut() {
            slot.take();
        }
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        mutex_lock(&self.state, SOURCE, "is_closed").closed
    }

    /// Current `(read, write)` cursors.
    pub fn cursors(&self) -> (u64, u64) {
        let state = mutex_lock(&self.state, SOURCE, "cursors");
        (state.read, state.write)
    }

    pub fn len(&self) -> usize {
        let (read, write) = self.cursors();
        (write - read) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
