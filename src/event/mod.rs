//! Cache entry events.
//!
//! A [`CacheEntryEvent`] describes one mutation of one local cache. It is
//! built once by whoever observed the mutation (usually a [`CacheListener`]),
//! sent once through the bus, and consumed once on every receiving node.
//!
//! [`CacheListener`]: crate::cache::CacheListener

mod apply;

use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub use apply::{ApplyOutcome, apply_event, invalidate, replicate};

/// Values carried by events and held by local caches.
pub type CacheValue = serde_json::Value;

/// Kind of mutation an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Added,
    Updated,
    Evicted,
    Expired,
}

impl EventType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Added => "ADDED",
            Self::Updated => "UPDATED",
            Self::Evicted => "EVICTED",
            Self::Expired => "EXPIRED",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies the entries an event touches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntryKey {
    /// A single entry.
    Key(String),
    /// Every entry of the cache.
    All,
}

impl EntryKey {
    pub fn key(key: impl Into<String>) -> Self {
        Self::Key(key.into())
    }

    pub fn as_key(&self) -> Option<&str> {
        match self {
            Self::Key(key) => Some(key),
            Self::All => None,
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => f.write_str(key),
            Self::All => f.write_str("*"),
        }
    }
}

/// Where the mutation behind an event came from.
///
/// Mutations the bus performs while applying a received event are tagged
/// `Remote`. Listeners copy the tag onto the events they build, and the send
/// path drops remote events so a change never bounces back into the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EventOrigin {
    #[default]
    Local,
    Remote,
}

impl EventOrigin {
    pub fn is_remote(self) -> bool {
        matches!(self, Self::Remote)
    }
}

/// One mutation of one local cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntryEvent {
    cache_name: String,
    key: EntryKey,
    old_value: Option<CacheValue>,
    new_value: Option<CacheValue>,
    event_time: OffsetDateTime,
    event_type: EventType,
    origin: EventOrigin,
    hash: u64,
}

impl CacheEntryEvent {
    pub fn builder(
        cache_name: impl Into<String>,
        key: EntryKey,
        event_type: EventType,
    ) -> CacheEntryEventBuilder {
        CacheEntryEventBuilder {
            cache_name: cache_name.into(),
            key,
            event_type,
            old_value: None,
            new_value: None,
            event_time: None,
            origin: EventOrigin::Local,
        }
    }

    pub fn added(cache_name: impl Into<String>, key: impl Into<String>, value: CacheValue) -> Self {
        Self::builder(cache_name, EntryKey::key(key), EventType::Added)
            .new_value(value)
            .build()
    }

    pub fn updated(
        cache_name: impl Into<String>,
        key: impl Into<String>,
        old_value: CacheValue,
        new_value: CacheValue,
    ) -> Self {
        Self::builder(cache_name, EntryKey::key(key), EventType::Updated)
            .old_value(old_value)
            .new_value(new_value)
            .build()
    }

    pub fn evicted(cache_name: impl Into<String>, key: impl Into<String>) -> Self {
        Self::builder(cache_name, EntryKey::key(key), EventType::Evicted).build()
    }

    /// Eviction of every entry of `cache_name`.
    pub fn cleared(cache_name: impl Into<String>) -> Self {
        Self::builder(cache_name, EntryKey::All, EventType::Evicted).build()
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn key(&self) -> &EntryKey {
        &self.key
    }

    pub fn old_value(&self) -> Option<&CacheValue> {
        self.old_value.as_ref()
    }

    pub fn new_value(&self) -> Option<&CacheValue> {
        self.new_value.as_ref()
    }

    pub fn event_time(&self) -> OffsetDateTime {
        self.event_time
    }

    /// Event time in microseconds since the Unix epoch.
    pub fn timestamp_micros(&self) -> i64 {
        unix_micros(self.event_time)
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn origin(&self) -> EventOrigin {
        self.origin
    }

    /// Routing hash derived from cache name and key.
    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// Copy of this event with values stripped, as shipped for invalidation caches.
    pub fn without_values(&self) -> Self {
        Self {
            old_value: None,
            new_value: None,
            ..self.clone()
        }
    }
}

pub struct CacheEntryEventBuilder {
    cache_name: String,
    key: EntryKey,
    event_type: EventType,
    old_value: Option<CacheValue>,
    new_value: Option<CacheValue>,
    event_time: Option<OffsetDateTime>,
    origin: EventOrigin,
}

impl CacheEntryEventBuilder {
    pub fn old_value(mut self, value: CacheValue) -> Self {
        self.old_value = Some(value);
        self
    }

    pub fn new_value(mut self, value: CacheValue) -> Self {
        self.new_value = Some(value);
        self
    }

    pub fn maybe_old_value(mut self, value: Option<CacheValue>) -> Self {
        self.old_value = value;
        self
    }

    pub fn maybe_new_value(mut self, value: Option<CacheValue>) -> Self {
        self.new_value = value;
        self
    }

    /// Defaults to the current time when not set.
    pub fn event_time(mut self, time: OffsetDateTime) -> Self {
        self.event_time = Some(time);
        self
    }

    pub fn origin(mut self, origin: EventOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn build(self) -> CacheEntryEvent {
        let hash = routing_hash(&self.cache_name, &self.key);
        CacheEntryEvent {
            cache_name: self.cache_name,
            key: self.key,
            old_value: self.old_value,
            new_value: self.new_value,
            event_time: self.event_time.unwrap_or_else(OffsetDateTime::now_utc),
            event_type: self.event_type,
            origin: self.origin,
            hash,
        }
    }
}

/// Deterministic routing hash for `(cache_name, key)`.
///
/// 64-bit FNV-1a, so every node computes the same value for the same entry.
pub fn routing_hash(cache_name: &str, key: &EntryKey) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    const SEPARATOR: u8 = 0x1f;
    const WILDCARD: u8 = 0xff;

    let fold = |hash: u64, byte: u8| (hash ^ u64::from(byte)).wrapping_mul(PRIME);
    let hash = cache_name.bytes().fold(OFFSET_BASIS, fold);
    let hash = fold(hash, SEPARATOR);
    match key {
        EntryKey::Key(key) => key.bytes().fold(hash, fold),
        EntryKey::All => fold(hash, WILDCARD),
    }
}

pub(crate) fn unix_micros(time: OffsetDateTime) -> i64 {
    let micros = time.unix_timestamp_nanos() / 1_000;
    i64::try_from(micros).unwrap_or(if micros < 0 { i64::MIN } else { i64::MAX })
}

pub(crate) fn from_unix_micros(micros: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(micros) * 1_000).ok()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn hash_is_stable_for_equal_entries() {
        let first = CacheEntryEvent::evicted("users", "alice");
        let second = CacheEntryEvent::updated("users", "alice", json!(1), json!(2));

        assert_eq!(first.hash(), second.hash());
        assert_eq!(first.hash(), routing_hash("users", &EntryKey::key("alice")));
    }

    #[test]
    fn hash_separates_cache_name_from_key() {
        let joined = routing_hash("ab", &EntryKey::key("c"));
        let shifted = routing_hash("a", &EntryKey::key("bc"));
        assert_ne!(joined, shifted);
    }

    #[test]
    fn wildcard_hash_differs_from_empty_key() {
        assert_ne!(
            routing_hash("users", &EntryKey::All),
            routing_hash("users", &EntryKey::key(""))
        );
    }

    #[test]
    fn builder_defaults_to_local_origin_and_now() {
        let before = OffsetDateTime::now_utc();
        let event = CacheEntryEvent::added("users", "bob", json!("v"));

        assert_eq!(event.origin(), EventOrigin::Local);
        assert_eq!(event.event_type(), EventType::Added);
        assert!(event.event_time() >= before);
        assert_eq!(event.new_value(), Some(&json!("v")));
        assert!(event.old_value().is_none());
    }

    #[test]
    fn micros_roundtrip_through_offset_datetime() {
        let time = OffsetDateTime::from_unix_timestamp(1_700_000_000).expect("valid timestamp");
        let micros = unix_micros(time);
        assert_eq!(micros, 1_700_000_000_000_000);
        assert_eq!(from_unix_micros(micros), Some(time));
    }

    #[test]
    fn without_values_keeps_identity() {
        let event = CacheEntryEvent::updated("users", "carol", json!(1), json!(2));
        let stripped = event.without_values();

        assert_eq!(stripped.hash(), event.hash());
        assert_eq!(stripped.key(), event.key());
        assert!(stripped.old_value().is_none());
        assert!(stripped.new_value().is_none());
    }
}
