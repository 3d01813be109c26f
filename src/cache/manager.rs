use std::sync::Arc;

use dashmap::DashMap;

use super::local::{CacheManager, LocalCache};
use super::store::MemoryCache;

/// Registry of [`MemoryCache`] instances, created on first use.
#[derive(Default)]
pub struct MemoryCacheManager {
    caches: DashMap<String, Arc<MemoryCache>>,
}

impl MemoryCacheManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cache called `name`, creating it when missing.
    pub fn get_or_create(&self, name: &str) -> Arc<MemoryCache> {
        self.caches
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(MemoryCache::new(name)))
            .clone()
    }

    pub fn memory_cache(&self, name: &str) -> Option<Arc<MemoryCache>> {
        self.caches.get(name).map(|cache| Arc::clone(&cache))
    }
}

impl CacheManager for MemoryCacheManager {
    fn cache(&self, name: &str) -> Option<Arc<dyn LocalCache>> {
        self.memory_cache(name).map(|cache| cache as Arc<dyn LocalCache>)
    }

    fn cache_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }
}
