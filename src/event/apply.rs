use std::cell::Cell;

use tracing::{debug, warn};

use super::{CacheEntryEvent, CacheValue, EntryKey, EventOrigin};
use crate::cache::{CacheError, CacheType, LocalCache};

const SOURCE: &str = "event::apply";

/// What applying an event did to the local cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The whole cache was cleared.
    Cleared,
    /// The key was evicted.
    Evicted,
    /// The key was absent and the new value was inserted.
    Inserted,
    /// The local value matched the event's old value and was replaced.
    Replaced,
    /// The local value diverged from the event's old value and was evicted.
    Desynchronized,
    /// Replication failed and the key was invalidated instead.
    Downgraded,
    /// Neither the policy nor the fallback could be applied.
    Failed,
}

/// Evict the event's key, or clear the cache for a wildcard key.
pub fn invalidate(cache: &dyn LocalCache, event: &CacheEntryEvent) -> Result<ApplyOutcome, CacheError> {
    match event.key() {
        EntryKey::All => {
            cache.clear(EventOrigin::Remote)?;
            Ok(ApplyOutcome::Cleared)
        }
        EntryKey::Key(key) => {
            cache.evict(key, EventOrigin::Remote)?;
            Ok(ApplyOutcome::Evicted)
        }
    }
}

/// Apply the event's new value through an atomic conditional merge.
///
/// The local value is replaced only when it still equals the event's old
/// value. A diverged local value is evicted. Events without a new value fall
/// back to [`invalidate`].
pub fn replicate(cache: &dyn LocalCache, event: &CacheEntryEvent) -> Result<ApplyOutcome, CacheError> {
    let (EntryKey::Key(key), Some(new_value)) = (event.key(), event.new_value()) else {
        return invalidate(cache, event);
    };

    let expected = event.old_value();
    let existed = Cell::new(false);
    let remap = |current: &CacheValue, incoming: &CacheValue| -> Option<CacheValue> {
        existed.set(true);
        (Some(current) == expected).then(|| incoming.clone())
    };

    let merged = cache.merge(key, new_value.clone(), &remap, EventOrigin::Remote)?;
    Ok(match (existed.get(), merged) {
        (false, _) => ApplyOutcome::Inserted,
        (true, Some(_)) => ApplyOutcome::Replaced,
        (true, None) => ApplyOutcome::Desynchronized,
    })
}

/// Apply `event` with the policy of `cache_type`.
///
/// Failures never escape: a failed replication is downgraded to evicting the
/// key, and a failed invalidation is logged and reported as
/// [`ApplyOutcome::Failed`].
pub fn apply_event(cache_type: CacheType, cache: &dyn LocalCache, event: &CacheEntryEvent) -> ApplyOutcome {
    let result = match cache_type {
        CacheType::Invalidated => invalidate(cache, event),
        CacheType::Replicated => match replicate(cache, event) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                warn!(
                    target_module = SOURCE,
                    cache = %event.cache_name(),
                    key = %event.key(),
                    error = %err,
                    "Replication failed, invalidating key instead"
                );
                invalidate(cache, event).map(|_| ApplyOutcome::Downgraded)
            }
        },
    };

    match result {
        Ok(outcome) => {
            debug!(
                target_module = SOURCE,
                cache = %event.cache_name(),
                key = %event.key(),
                event_type = %event.event_type(),
                ?outcome,
                "Applied remote event"
            );
            outcome
        }
        Err(err) => {
            warn!(
                target_module = SOURCE,
                cache = %event.cache_name(),
                key = %event.key(),
                error = %err,
                "Failed to apply remote event"
            );
            ApplyOutcome::Failed
        }
    }
}
