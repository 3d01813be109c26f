#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use cachebus::channel::{MessageConsumer, RecoverySettings};
use cachebus::codec::{EventConverter, JsonEventConverter};
use cachebus::{
    BusConfig, CacheBus, CacheEntryEvent, LoopbackChannel, LoopbackHub, MemoryCache,
    MemoryCacheManager, MessageChannel,
};

/// One bus with its caches and the loopback channel it sends on.
pub struct Node {
    pub bus: CacheBus,
    pub caches: Arc<MemoryCacheManager>,
    pub channel: Arc<LoopbackChannel>,
}

impl Node {
    pub fn new(hub: &LoopbackHub, config: BusConfig, cache_names: &[&str]) -> Self {
        let caches = Arc::new(MemoryCacheManager::new());
        for name in cache_names {
            caches.get_or_create(name);
        }
        let channel = Arc::new(hub.channel());
        let bus = CacheBus::builder(config)
            .channel(channel.clone())
            .cache_manager(caches.clone())
            .build()
            .expect("bus builds");
        Self { bus, caches, channel }
    }

    pub fn cache(&self, name: &str) -> Arc<MemoryCache> {
        self.caches.get_or_create(name)
    }

    /// Start the bus and hook it to its caches.
    pub fn start(&self) {
        self.bus.start().expect("bus starts");
        self.bus.register_listeners();
    }
}

/// Decodes and keeps every message the hub hands it.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<CacheEntryEvent>>,
}

impl Recorder {
    /// Subscribe a new recorder to `hub` through a channel of its own.
    pub fn attach(hub: &LoopbackHub) -> (Arc<Self>, LoopbackChannel) {
        let recorder = Arc::new(Self::default());
        let channel = hub.channel();
        channel
            .subscribe(recorder.clone())
            .expect("recorder subscribes");
        (recorder, channel)
    }

    pub fn events(&self) -> Vec<CacheEntryEvent> {
        self.events.lock().expect("recorder lock").clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().expect("recorder lock").len()
    }
}

impl MessageConsumer for Recorder {
    fn accept(&self, _hash: u64, body: Bytes) {
        let event = JsonEventConverter
            .from_binary(&body)
            .expect("recorded message decodes");
        self.events.lock().expect("recorder lock").push(event);
    }
}

pub fn short_recovery() -> RecoverySettings {
    RecoverySettings {
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(40),
        max_recovery_time: Duration::from_millis(200),
        ..RecoverySettings::default()
    }
}

/// Poll `condition` until it holds or `timeout` runs out.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}
