//! In-memory [`LocalCache`] used by embedded deployments and tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::trace;

use super::local::{CacheError, CacheListener, ListenerId, LocalCache, Remap};
use crate::event::{CacheEntryEvent, CacheValue, EntryKey, EventOrigin, EventType};
use crate::sync::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";

type Listeners = Vec<(ListenerId, Arc<dyn CacheListener>)>;

/// Concurrent map with mutation listeners.
///
/// Listeners run on the mutating thread after the entry lock is released.
pub struct MemoryCache {
    name: String,
    entries: DashMap<String, CacheValue>,
    listeners: RwLock<Listeners>,
    next_listener: AtomicU64,
}

impl MemoryCache {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop `key` as if its time-to-live ran out, notifying listeners with
    /// an `EXPIRED` event.
    pub fn expire(&self, key: &str) -> Option<CacheValue> {
        let (_, old) = self.entries.remove(key)?;
        self.notify(
            EventType::Expired,
            EntryKey::key(key),
            Some(old.clone()),
            None,
            EventOrigin::Local,
        );
        Some(old)
    }

    fn notify(
        &self,
        event_type: EventType,
        key: EntryKey,
        old_value: Option<CacheValue>,
        new_value: Option<CacheValue>,
        origin: EventOrigin,
    ) {
        let listeners: Vec<Arc<dyn CacheListener>> = rw_read(&self.listeners, SOURCE, "notify")
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        if listeners.is_empty() {
            return;
        }

        let event = CacheEntryEvent::builder(self.name.as_str(), key, event_type)
            .maybe_old_value(old_value)
            .maybe_new_value(new_value)
            .origin(origin)
            .build();
        trace!(
            target_module = SOURCE,
            cache = %self.name,
            key = %event.key(),
            event_type = %event_type,
            ?origin,
            listeners = listeners.len(),
            "Notifying cache listeners"
        );
        for listener in listeners {
            listener.on_event(&event);
        }
    }
}

impl LocalCache for MemoryCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> Option<CacheValue> {
        self.entries.get(key).map(|value| value.clone())
    }

    fn put(&self, key: &str, value: CacheValue, origin: EventOrigin) -> Result<Option<CacheValue>, CacheError> {
        let old = self.entries.insert(key.to_owned(), value.clone());
        let event_type = if old.is_some() {
            EventType::Updated
        } else {
            EventType::Added
        };
        self.notify(event_type, EntryKey::key(key), old.clone(), Some(value), origin);
        Ok(old)
    }

    fn put_if_absent(
        &self,
        key: &str,
        value: CacheValue,
        origin: EventOrigin,
    ) -> Result<Option<CacheValue>, CacheError> {
        match self.entries.entry(key.to_owned()) {
            Entry::Occupied(existing) => Ok(Some(existing.get().clone())),
            Entry::Vacant(slot) => {
                slot.insert(value.clone());
                self.notify(EventType::Added, EntryKey::key(key), None, Some(value), origin);
                Ok(None)
            }
        }
    }

    fn evict(&self, key: &str, origin: EventOrigin) -> Result<(), CacheError> {
        self.remove(key, origin).map(|_| ())
    }

    fn remove(&self, key: &str, origin: EventOrigin) -> Result<Option<CacheValue>, CacheError> {
        let Some((_, old)) = self.entries.remove(key) else {
            return Ok(None);
        };
        self.notify(EventType::Evicted, EntryKey::key(key), Some(old.clone()), None, origin);
        Ok(Some(old))
    }

    /// Always notifies, since other nodes may hold entries this one lacks.
    fn clear(&self, origin: EventOrigin) -> Result<(), CacheError> {
        self.entries.clear();
        self.notify(EventType::Evicted, EntryKey::All, None, None, origin);
        Ok(())
    }

    fn merge(
        &self,
        key: &str,
        value: CacheValue,
        remap: Remap<'_>,
        origin: EventOrigin,
    ) -> Result<Option<CacheValue>, CacheError> {
        // Resolve under the entry lock, notify after releasing it.
        let (event_type, old, new) = match self.entries.entry(key.to_owned()) {
            Entry::Vacant(slot) => {
                slot.insert(value.clone());
                (EventType::Added, None, Some(value))
            }
            Entry::Occupied(mut existing) => match remap(existing.get(), &value) {
                Some(next) => {
                    let old = std::mem::replace(existing.get_mut(), next.clone());
                    (EventType::Updated, Some(old), Some(next))
                }
                None => {
                    let (_, old) = existing.remove_entry();
                    (EventType::Evicted, Some(old), None)
                }
            },
        };

        self.notify(event_type, EntryKey::key(key), old, new.clone(), origin);
        Ok(new)
    }

    fn compute_if_absent(
        &self,
        key: &str,
        compute: &dyn Fn(&str) -> CacheValue,
        origin: EventOrigin,
    ) -> Result<CacheValue, CacheError> {
        let computed = match self.entries.entry(key.to_owned()) {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let value = compute(key);
                slot.insert(value.clone());
                value
            }
        };
        self.notify(EventType::Added, EntryKey::key(key), None, Some(computed.clone()), origin);
        Ok(computed)
    }

    fn register_listener(&self, listener: Arc<dyn CacheListener>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        rw_write(&self.listeners, SOURCE, "register_listener").push((id, listener));
        id
    }

    fn unregister_listener(&self, id: ListenerId) -> bool {
        let mut listeners = rw_write(&self.listeners, SOURCE, "unregister_listener");
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<CacheEntryEvent>>,
    }

    impl CacheListener for Recorder {
        fn on_event(&self, event: &CacheEntryEvent) {
            self.events.lock().expect("recorder lock").push(event.clone());
        }
    }

    impl Recorder {
        fn kinds(&self) -> Vec<(EventType, EventOrigin)> {
            self.events
                .lock()
                .expect("recorder lock")
                .iter()
                .map(|event| (event.event_type(), event.origin()))
                .collect()
        }
    }

    fn observed_cache() -> (MemoryCache, Arc<Recorder>) {
        let cache = MemoryCache::new("users");
        let recorder = Arc::new(Recorder::default());
        cache.register_listener(recorder.clone());
        (cache, recorder)
    }

    #[test]
    fn put_reports_added_then_updated() {
        let (cache, recorder) = observed_cache();
        cache.put("k", json!(1), EventOrigin::Local).unwrap();
        let old = cache.put("k", json!(2), EventOrigin::Local).unwrap();

        assert_eq!(old, Some(json!(1)));
        assert_eq!(
            recorder.kinds(),
            [
                (EventType::Added, EventOrigin::Local),
                (EventType::Updated, EventOrigin::Local)
            ]
        );
    }

    #[test]
    fn listener_sees_origin_of_mutation() {
        let (cache, recorder) = observed_cache();
        cache.put("k", json!(1), EventOrigin::Remote).unwrap();
        cache.evict("k", EventOrigin::Remote).unwrap();

        assert_eq!(
            recorder.kinds(),
            [
                (EventType::Added, EventOrigin::Remote),
                (EventType::Evicted, EventOrigin::Remote)
            ]
        );
    }

    #[test]
    fn evicting_missing_key_is_silent() {
        let (cache, recorder) = observed_cache();
        cache.evict("missing", EventOrigin::Local).unwrap();
        assert!(recorder.kinds().is_empty());
    }

    #[test]
    fn clear_reports_wildcard_eviction() {
        let (cache, recorder) = observed_cache();
        cache.put("a", json!(1), EventOrigin::Local).unwrap();
        cache.clear(EventOrigin::Local).unwrap();

        let events = recorder.events.lock().unwrap();
        let last = events.last().expect("clear event");
        assert!(last.key().is_all());
        assert_eq!(last.event_type(), EventType::Evicted);
        assert!(cache.is_empty());
    }

    #[test]
    fn put_if_absent_keeps_existing_value() {
        let (cache, recorder) = observed_cache();
        assert_eq!(cache.put_if_absent("k", json!(1), EventOrigin::Local).unwrap(), None);
        assert_eq!(
            cache.put_if_absent("k", json!(2), EventOrigin::Local).unwrap(),
            Some(json!(1))
        );
        assert_eq!(cache.get("k"), Some(json!(1)));
        assert_eq!(recorder.kinds().len(), 1);
    }

    #[test]
    fn compute_if_absent_runs_once() {
        let cache = MemoryCache::new("users");
        let first = cache
            .compute_if_absent("k", &|key| json!(format!("{key}-computed")), EventOrigin::Local)
            .unwrap();
        let second = cache
            .compute_if_absent("k", &|_| json!("other"), EventOrigin::Local)
            .unwrap();

        assert_eq!(first, json!("k-computed"));
        assert_eq!(second, first);
    }

    #[test]
    fn merge_removes_entry_when_remap_declines() {
        let cache = MemoryCache::new("users");
        cache.put("k", json!("x"), EventOrigin::Local).unwrap();

        let merged = cache
            .merge("k", json!("z"), &|_, _| None, EventOrigin::Remote)
            .unwrap();

        assert_eq!(merged, None);
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn expire_reports_expired_event() {
        let (cache, recorder) = observed_cache();
        cache.put("k", json!(1), EventOrigin::Local).unwrap();

        assert_eq!(cache.expire("k"), Some(json!(1)));
        assert_eq!(recorder.kinds().last(), Some(&(EventType::Expired, EventOrigin::Local)));
    }

    #[test]
    fn unregistered_listener_stops_receiving() {
        let cache = MemoryCache::new("users");
        let recorder = Arc::new(Recorder::default());
        let id = cache.register_listener(recorder.clone());

        assert!(cache.unregister_listener(id));
        assert!(!cache.unregister_listener(id));
        cache.put("k", json!(1), EventOrigin::Local).unwrap();
        assert!(recorder.kinds().is_empty());
    }
}
