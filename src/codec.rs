//! Wire encoding of cache entry events.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::{
    CacheEntryEvent, CacheValue, EntryKey, EventOrigin, EventType, from_unix_micros,
};

/// Version tag written into every message.
pub const WIRE_VERSION: u16 = 1;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode event: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode event: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("unsupported wire version {found} (expected {expected})")]
    UnsupportedVersion { found: u16, expected: u16 },
    #[error("event time {micros}us is out of range")]
    InvalidTime { micros: i64 },
}

/// Converts events to and from message bodies.
pub trait EventConverter: Send + Sync {
    /// Encode `event`, dropping its values unless `include_values` is set.
    fn to_binary(&self, event: &CacheEntryEvent, include_values: bool) -> Result<Bytes, CodecError>;

    /// Decode a message body. Decoded events always have remote origin.
    fn from_binary(&self, body: &[u8]) -> Result<CacheEntryEvent, CodecError>;
}

/// JSON encoding of events.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEventConverter;

#[derive(Serialize, Deserialize)]
struct WireEvent {
    v: u16,
    cache: String,
    /// `None` is the wildcard key.
    key: Option<String>,
    #[serde(rename = "type")]
    event_type: EventType,
    time_us: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    old: Option<CacheValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    new: Option<CacheValue>,
}

impl EventConverter for JsonEventConverter {
    fn to_binary(&self, event: &CacheEntryEvent, include_values: bool) -> Result<Bytes, CodecError> {
        let (old, new) = if include_values {
            (event.old_value().cloned(), event.new_value().cloned())
        } else {
            (None, None)
        };
        let wire = WireEvent {
            v: WIRE_VERSION,
            cache: event.cache_name().to_owned(),
            key: event.key().as_key().map(str::to_owned),
            event_type: event.event_type(),
            time_us: event.timestamp_micros(),
            old,
            new,
        };
        serde_json::to_vec(&wire)
            .map(Bytes::from)
            .map_err(CodecError::Encode)
    }

    fn from_binary(&self, body: &[u8]) -> Result<CacheEntryEvent, CodecError> {
        let wire: WireEvent = serde_json::from_slice(body).map_err(CodecError::Decode)?;
        if wire.v != WIRE_VERSION {
            return Err(CodecError::UnsupportedVersion {
                found: wire.v,
                expected: WIRE_VERSION,
            });
        }
        let event_time =
            from_unix_micros(wire.time_us).ok_or(CodecError::InvalidTime { micros: wire.time_us })?;
        let key = wire.key.map_or(EntryKey::All, EntryKey::Key);

        Ok(CacheEntryEvent::builder(wire.cache, key, wire.event_type)
            .maybe_old_value(wire.old)
            .maybe_new_value(wire.new)
            .event_time(event_time)
            .origin(EventOrigin::Remote)
            .build())
    }
}
