//! Local cache contracts and configuration.
//!
//! The bus never stores data itself. It talks to node-local caches through
//! [`LocalCache`] and finds them through a [`CacheManager`]:
//!
//! - **Contracts**: [`LocalCache`], [`CacheListener`], [`CacheManager`]
//! - **Configuration**: [`CacheConfig`] with its [`CacheType`] and optional
//!   [`TimestampComparison`]
//! - **In-memory implementations**: [`MemoryCache`], [`MemoryCacheManager`]
//!
//! ## Configuration
//!
//! Caches are declared in `cachebus.toml`:
//!
//! ```toml
//! [[caches]]
//! name = "users"
//! type = "invalidated"
//! aliases = ["users_legacy"]
//!
//! [[caches]]
//! name = "sessions"
//! type = "replicated"
//! use_timestamp = true
//! timestamp = { probable_element_count = 5000, expiration_seconds = 120 }
//! ```

mod config;
mod local;
mod manager;
mod store;

pub use config::{CacheConfig, CacheConfigBuilder, CacheType, TimestampComparison};
pub use local::{CacheError, CacheListener, CacheManager, ListenerId, LocalCache, Remap};
pub use manager::MemoryCacheManager;
pub use store::MemoryCache;
