//! Last-applied timestamps for conflict resolution.
//!
//! For caches with timestamp comparison enabled, every event's time is
//! recorded per key. A later event for the same key is applied only when its
//! time is strictly greater than the recorded one, so a delayed message can
//! never overwrite a newer change.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use metrics::{counter, gauge};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::cache::TimestampComparison;
use crate::event::{CacheEntryEvent, EntryKey, unix_micros};
use crate::sync::lock::mutex_lock;
use crate::telemetry::BusMetric;

const SOURCE: &str = "timestamp";

const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// How the store runs its cleanups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampStoreSettings {
    /// Run cleanups on a background thread instead of the saving thread.
    pub async_cleanup: bool,
    /// Minimum time between two cleanups of one cache.
    pub cleanup_interval: Duration,
}

impl Default for TimestampStoreSettings {
    fn default() -> Self {
        Self {
            async_cleanup: true,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

struct CacheTimestamps {
    cache: String,
    entries: DashMap<String, AtomicI64>,
    last_cleanup: Mutex<Instant>,
    cleaning: AtomicBool,
}

impl CacheTimestamps {
    fn new(cache: &str) -> Self {
        Self {
            cache: cache.to_owned(),
            entries: DashMap::new(),
            last_cleanup: Mutex::new(Instant::now()),
            cleaning: AtomicBool::new(false),
        }
    }

    fn save(&self, key: &str, micros: i64) -> bool {
        if let Some(slot) = self.entries.get(key) {
            return advance(&slot, micros);
        }
        match self.entries.entry(key.to_owned()) {
            Entry::Vacant(slot) => {
                slot.insert(AtomicI64::new(micros));
                true
            }
            Entry::Occupied(slot) => advance(slot.get(), micros),
        }
    }

    fn cleanup_due(&self, comparison: &TimestampComparison, interval: Duration) -> bool {
        self.entries.len() > comparison.probable_element_count
            && mutex_lock(&self.last_cleanup, SOURCE, "cleanup_due").elapsed() >= interval
    }

    /// Drop records older than `expiration`. Returns the number removed, or
    /// `None` when another cleanup of this cache is already running.
    fn cleanup(&self, expiration: Duration) -> Option<usize> {
        self.try_begin_cleanup().then(|| self.purge(expiration))
    }

    fn try_begin_cleanup(&self) -> bool {
        self.cleaning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Caller must hold the cleanup flag; it is released on return.
    fn purge(&self, expiration: Duration) -> usize {
        let window = i64::try_from(expiration.as_micros()).unwrap_or(i64::MAX);
        let cutoff = unix_micros(OffsetDateTime::now_utc()).saturating_sub(window);
        let before = self.entries.len();
        self.entries
            .retain(|_, recorded| recorded.load(Ordering::Acquire) >= cutoff);
        let remaining = self.entries.len();
        let removed = before.saturating_sub(remaining);

        *mutex_lock(&self.last_cleanup, SOURCE, "purge") = Instant::now();
        self.cleaning.store(false, Ordering::Release);

        counter!(BusMetric::TimestampCleanups.id(), "cache" => self.cache.clone()).increment(1);
        gauge!(BusMetric::TimestampEntries.id(), "cache" => self.cache.clone()).set(remaining as f64);
        debug!(
            target_module = SOURCE,
            cache = %self.cache,
            removed,
            remaining,
            "Timestamp cleanup finished"
        );
        removed
    }
}

/// Raise `slot` to `micros` if that is strictly greater.
fn advance(slot: &AtomicI64, micros: i64) -> bool {
    let mut current = slot.load(Ordering::Acquire);
    loop {
        if micros <= current {
            return false;
        }
        match slot.compare_exchange_weak(current, micros, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return true,
            Err(actual) => current = actual,
        }
    }
}

/// Per-cache map of key to last accepted event time.
pub struct TimestampStore {
    settings: TimestampStoreSettings,
    caches: DashMap<String, Arc<CacheTimestamps>>,
}

impl TimestampStore {
    pub fn new(settings: TimestampStoreSettings) -> Self {
        Self {
            settings,
            caches: DashMap::new(),
        }
    }

    /// Record the event's time if it is newer than the last one for its key.
    ///
    /// Returns `false` when the event is stale. Wildcard events are always
    /// accepted and leave the records untouched.
    pub fn save(&self, event: &CacheEntryEvent, comparison: &TimestampComparison) -> bool {
        let EntryKey::Key(key) = event.key() else {
            return true;
        };

        let table = self.table(event.cache_name());
        let accepted = table.save(key, event.timestamp_micros());

        if table.cleanup_due(comparison, self.settings.cleanup_interval) {
            self.schedule_cleanup(table, comparison.expiration);
        }
        accepted
    }

    /// Number of records kept for `cache`.
    pub fn len(&self, cache: &str) -> usize {
        self.caches
            .get(cache)
            .map_or(0, |table| table.entries.len())
    }

    /// Last accepted event time for `key`, in microseconds since the epoch.
    pub fn last_micros(&self, cache: &str, key: &str) -> Option<i64> {
        let table = self.caches.get(cache)?;
        let micros = table.entries.get(key)?.load(Ordering::Acquire);
        Some(micros)
    }

    /// Run a cleanup of `cache` immediately on the calling thread.
    pub fn cleanup_now(&self, cache: &str, expiration: Duration) -> Option<usize> {
        let table = self.caches.get(cache).map(|table| Arc::clone(&table))?;
        table.cleanup(expiration)
    }

    /// Drop every record of every cache.
    pub fn clear(&self) {
        self.caches.clear();
    }

    fn table(&self, cache: &str) -> Arc<CacheTimestamps> {
        if let Some(table) = self.caches.get(cache) {
            return Arc::clone(&table);
        }
        self.caches
            .entry(cache.to_owned())
            .or_insert_with(|| Arc::new(CacheTimestamps::new(cache)))
            .clone()
    }

    fn schedule_cleanup(&self, table: Arc<CacheTimestamps>, expiration: Duration) {
        if !self.settings.async_cleanup {
            table.cleanup(expiration);
            return;
        }
        if !table.try_begin_cleanup() {
            return;
        }

        let worker = Arc::clone(&table);
        let spawned = thread::Builder::new()
            .name("cachebus-timestamp-cleanup".to_owned())
            .spawn(move || {
                worker.purge(expiration);
            });
        if let Err(err) = spawned {
            warn!(
                target_module = SOURCE,
                cache = %table.cache,
                error = %err,
                "Failed to spawn timestamp cleanup thread, cleaning inline"
            );
            table.purge(expiration);
        }
    }
}
