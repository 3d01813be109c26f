//! Propagates cache mutations between nodes that each run an autonomous
//! local cache.
//!
//! Every node runs a [`CacheBus`]. The bus listens to its local caches and
//! ships their events over a [`MessageChannel`](channel::MessageChannel).
//! Peers apply what they receive in one of two ways, chosen per cache:
//! invalidated caches drop the entry, replicated caches install the shipped
//! value when their current value still matches.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use cachebus::{BusConfig, CacheBus, CacheConfig, LoopbackHub, MemoryCacheManager};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BusConfig::builder()
//!     .cache(CacheConfig::invalidated("users").build()?)
//!     .build()?;
//! let caches = Arc::new(MemoryCacheManager::new());
//! caches.get_or_create("users");
//!
//! let hub = LoopbackHub::new();
//! let bus = CacheBus::builder(config)
//!     .channel(Arc::new(hub.channel()))
//!     .cache_manager(caches)
//!     .build()?;
//! bus.start()?;
//! bus.register_listeners();
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod bus;
pub mod cache;
pub mod channel;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod error;
pub mod event;
pub mod health;
pub mod producer;
pub mod sync;
pub mod telemetry;
pub mod timestamp;

pub use bus::{BusConfig, CacheBus, DispatchMode};
pub use cache::{
    CacheConfig, CacheManager, CacheType, LocalCache, MemoryCache, MemoryCacheManager, TimestampComparison,
};
pub use channel::{LoopbackChannel, LoopbackHub, MessageChannel};
pub use error::{BusError, ConfigError};
pub use event::{CacheEntryEvent, CacheValue, EntryKey, EventOrigin, EventType};
pub use health::{BusHealth, HealthStatus};
