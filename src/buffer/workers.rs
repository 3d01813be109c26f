use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use metrics::counter;
use tracing::{debug, error, warn};

use super::{BufferClosed, StripedRingBuffer};
use crate::sync::lock::mutex_lock;
use crate::telemetry::BusMetric;

const SOURCE: &str = "buffer::workers";

/// What a stripe worker does after handling an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerVerdict {
    Continue,
    /// Stop this worker and close its stripe for good.
    Exit,
    /// Stop this worker because the bus is shutting down. Not a failure.
    Cancelled,
}

/// One dedicated thread per stripe of a [`StripedRingBuffer`].
///
/// A worker that exits or panics is never restarted. Its stripe is closed so
/// later offers fail fast instead of blocking on a buffer nobody drains.
pub(crate) struct StripeWorkers<T> {
    role: &'static str,
    buffer: Arc<StripedRingBuffer<T>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    failed: Arc<AtomicUsize>,
}

impl<T: Send + 'static> StripeWorkers<T> {
    pub(crate) fn spawn<H>(role: &'static str, buffer: StripedRingBuffer<T>, handler: H) -> std::io::Result<Self>
    where
        H: Fn(usize, T) -> WorkerVerdict + Send + Sync + 'static,
    {
        let buffer = Arc::new(buffer);
        let handler = Arc::new(handler);
        let failed = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::with_capacity(buffer.stripe_count());

        for stripe in 0..buffer.stripe_count() {
            let buffer_for_worker = Arc::clone(&buffer);
            let handler = Arc::clone(&handler);
            let failed = Arc::clone(&failed);
            let spawned = thread::Builder::new()
                .name(format!("cachebus-{role}-{stripe}"))
                .spawn(move || run_stripe(role, stripe, &buffer_for_worker, handler.as_ref(), &failed));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    buffer.close();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(err);
                }
            }
        }

        debug!(
            target_module = SOURCE,
            role,
            stripes = buffer.stripe_count(),
            "Stripe workers started"
        );
        Ok(Self {
            role,
            buffer,
            handles: Mutex::new(handles),
            failed,
        })
    }

    pub(crate) fn offer(&self, hash: u64, item: T) -> Result<bool, BufferClosed> {
        self.buffer.offer(hash, item)
    }

    /// Workers that ended because of a panic.
    pub(crate) fn failed_workers(&self) -> usize {
        self.failed.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn buffer(&self) -> &StripedRingBuffer<T> {
        &self.buffer
    }

    /// Close every stripe and join the workers. Queued items are discarded.
    pub(crate) fn shutdown(&self) {
        self.buffer.close();
        let handles = std::mem::take(&mut *mutex_lock(&self.handles, SOURCE, "shutdown"));
        for handle in handles {
            if handle.join().is_err() {
                warn!(target_module = SOURCE, role = self.role, "Stripe worker ended abnormally");
            }
        }
        debug!(target_module = SOURCE, role = self.role, "Stripe workers stopped");
    }
}

fn run_stripe<T, H>(role: &'static str, stripe: usize, buffer: &StripedRingBuffer<T>, handler: &H, failed: &AtomicUsize)
where
    H: Fn(usize, T) -> WorkerVerdict,
{
    loop {
        let item = match buffer.poll(stripe) {
            Ok(item) => item,
            Err(BufferClosed) => {
                debug!(target_module = SOURCE, role, stripe, "Stripe closed, worker exiting");
                return;
            }
        };

        match catch_unwind(AssertUnwindSafe(|| handler(stripe, item))) {
            Ok(WorkerVerdict::Continue) => {}
            Ok(WorkerVerdict::Exit) => {
                warn!(target_module = SOURCE, role, stripe, "Stripe worker terminated");
                counter!(BusMetric::WorkerFailures.id(), "role" => role).increment(1);
                buffer.close_stripe(stripe);
                return;
            }
            Ok(WorkerVerdict::Cancelled) => {
                debug!(target_module = SOURCE, role, stripe, "Stripe worker cancelled");
                buffer.close_stripe(stripe);
                return;
            }
            Err(_) => {
                failed.fetch_add(1, Ordering::AcqRel);
                error!(target_module = SOURCE, role, stripe, "Stripe worker panicked");
                counter!(BusMetric::WorkerFailures.id(), "role" => role).increment(1);
                buffer.close_stripe(stripe);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::{Duration, Instant};

    use super::*;

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn each_stripe_drains_in_order() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let workers = {
            let seen = Arc::clone(&seen);
            StripeWorkers::spawn(
                "test",
                StripedRingBuffer::new("test", 4, 8).unwrap(),
                move |stripe, value: u32| {
                    seen.lock().unwrap().push((stripe, value));
                    WorkerVerdict::Continue
                },
            )
            .unwrap()
        };

        for value in 0..100 {
            workers.offer(3, value).unwrap();
        }
        assert!(wait_for(|| seen.lock().unwrap().len() == 100));
        workers.shutdown();

        let seen = seen.lock().unwrap();
        assert!(seen.iter().all(|(stripe, _)| *stripe == 3));
        let values: Vec<u32> = seen.iter().map(|(_, value)| *value).collect();
        assert_eq!(values, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn panicking_handler_kills_only_its_stripe() {
        let workers = StripeWorkers::spawn(
            "test",
            StripedRingBuffer::new("test", 2, 4).unwrap(),
            |stripe, _: u8| {
                if stripe == 0 {
                    panic!("handler failure");
                }
                WorkerVerdict::Continue
            },
        )
        .unwrap();

        workers.offer(0, 1).unwrap();
        assert!(wait_for(|| workers.failed_workers() == 1));
        assert!(wait_for(|| workers.offer(0, 2).is_err()));
        assert_eq!(workers.offer(1, 3), Ok(false));
        workers.shutdown();
    }

    #[test]
    fn exit_verdict_closes_the_stripe_without_counting_a_panic() {
        let workers = StripeWorkers::spawn(
            "test",
            StripedRingBuffer::new("test", 1, 4).unwrap(),
            |_, _: u8| WorkerVerdict::Exit,
        )
        .unwrap();

        workers.offer(0, 1).unwrap();
        assert!(wait_for(|| workers.buffer().offer(0, 2).is_err()));
        assert_eq!(workers.failed_workers(), 0);
        workers.shutdown();
    }

    #[test]
    fn cancelled_verdict_stops_only_its_stripe() {
        let workers = StripeWorkers::spawn(
            "test",
            StripedRingBuffer::new("test", 2, 4).unwrap(),
            |stripe, _: u8| {
                if stripe == 0 {
                    WorkerVerdict::Cancelled
                } else {
                    WorkerVerdict::Continue
                }
            },
        )
        .unwrap();

        workers.offer(0, 1).unwrap();
        assert!(wait_for(|| workers.offer(0, 2).is_err()));
        assert_eq!(workers.offer(1, 3), Ok(false));
        assert_eq!(workers.failed_workers(), 0);
        workers.shutdown();
    }
}
