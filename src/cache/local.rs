//! Contracts between the bus and the caches it keeps in sync.

use std::sync::Arc;

use thiserror::Error;

use crate::event::{CacheEntryEvent, CacheValue, EventOrigin};
use crate::health::ComponentHealth;

/// Failure raised by a local cache operation.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache `{cache}` rejected `{op}`: {reason}")]
    Rejected {
        cache: String,
        op: &'static str,
        reason: String,
    },
    #[error("cache `{cache}` is unavailable")]
    Unavailable { cache: String },
}

impl CacheError {
    pub fn rejected(cache: &str, op: &'static str, reason: impl Into<String>) -> Self {
        Self::Rejected {
            cache: cache.to_owned(),
            op,
            reason: reason.into(),
        }
    }
}

/// Remapping function passed to [`LocalCache::merge`].
///
/// Called with the current and the incoming value; returning `None` removes
/// the entry.
pub type Remap<'a> = &'a dyn Fn(&CacheValue, &CacheValue) -> Option<CacheValue>;

/// Handle returned by [`LocalCache::register_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Observer of the mutations of one local cache.
///
/// Events handed to a listener carry the [`EventOrigin`] of the mutation that
/// produced them.
pub trait CacheListener: Send + Sync {
    fn on_event(&self, event: &CacheEntryEvent);
}

/// A node-local cache the bus reads and mutates.
///
/// Every mutator takes the origin of the change so listeners can tell local
/// writes from writes the bus applied on behalf of another node.
pub trait LocalCache: Send + Sync {
    fn name(&self) -> &str;

    fn get(&self, key: &str) -> Option<CacheValue>;

    /// Store `value`, returning the previous value.
    fn put(&self, key: &str, value: CacheValue, origin: EventOrigin) -> Result<Option<CacheValue>, CacheError>;

    /// Store `value` unless the key exists, returning the existing value.
    fn put_if_absent(
        &self,
        key: &str,
        value: CacheValue,
        origin: EventOrigin,
    ) -> Result<Option<CacheValue>, CacheError>;

    /// Drop the key if present.
    fn evict(&self, key: &str, origin: EventOrigin) -> Result<(), CacheError>;

    /// Drop the key, returning its value.
    fn remove(&self, key: &str, origin: EventOrigin) -> Result<Option<CacheValue>, CacheError>;

    /// Drop every entry.
    fn clear(&self, origin: EventOrigin) -> Result<(), CacheError>;

    /// Atomically combine `value` with the current entry.
    ///
    /// An absent key receives `value` unchanged. A present key receives the
    /// result of `remap(current, value)`, or is removed when `remap` returns
    /// `None`. Returns the value stored afterwards.
    fn merge(
        &self,
        key: &str,
        value: CacheValue,
        remap: Remap<'_>,
        origin: EventOrigin,
    ) -> Result<Option<CacheValue>, CacheError>;

    /// Return the entry, computing and storing it first when absent.
    fn compute_if_absent(
        &self,
        key: &str,
        compute: &dyn Fn(&str) -> CacheValue,
        origin: EventOrigin,
    ) -> Result<CacheValue, CacheError>;

    fn register_listener(&self, listener: Arc<dyn CacheListener>) -> ListenerId;

    /// Returns `false` when no listener had that id.
    fn unregister_listener(&self, id: ListenerId) -> bool;
}

/// Lookup of local caches by name.
pub trait CacheManager: Send + Sync {
    fn cache(&self, name: &str) -> Option<Arc<dyn LocalCache>>;

    fn cache_names(&self) -> Vec<String>;

    fn health(&self) -> ComponentHealth {
        ComponentHealth::up()
    }
}
