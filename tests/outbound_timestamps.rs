mod common;

use cachebus::codec::{EventConverter, JsonEventConverter};
use cachebus::telemetry::BusMetric;
use cachebus::{
    BusConfig, CacheConfig, CacheEntryEvent, EntryKey, EventOrigin, EventType, LocalCache,
    LoopbackHub, TimestampComparison,
};
use metrics_util::debugging::{DebugValue, DebuggingRecorder};
use serde_json::json;
use time::OffsetDateTime;

use common::Node;

#[test]
fn local_writes_make_older_remote_events_stale() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    let config = BusConfig::builder()
        .cache(
            CacheConfig::replicated("prices")
                .timestamp(TimestampComparison::default())
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();
    let hub = LoopbackHub::new();
    let node = Node::new(&hub, config, &["prices"]);
    node.start();

    let at = |seconds: i64| OffsetDateTime::from_unix_timestamp(seconds).unwrap();

    // The local write at t=100 goes through the send path, which records
    // its timestamp before producing.
    node.cache("prices").put("k", json!("local"), EventOrigin::Remote).unwrap();
    node.bus.send(
        CacheEntryEvent::builder("prices", EntryKey::key("k"), EventType::Added)
            .new_value(json!("local"))
            .event_time(at(100))
            .build(),
    );
    assert_eq!(node.channel.sent_count(), 1);

    let inbound = CacheEntryEvent::builder("prices", EntryKey::key("k"), EventType::Updated)
        .old_value(json!("local"))
        .new_value(json!("remote"))
        .event_time(at(90))
        .build();
    node.bus.receive(&JsonEventConverter.to_binary(&inbound, true).unwrap());

    assert_eq!(node.cache("prices").get("k"), Some(json!("local")));

    let stale: u64 = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .filter(|(composite_key, _, _, _)| {
            let key = composite_key.key();
            key.name() == BusMetric::StaleEvents.id()
                && key.labels().any(|label| label.key() == "cache" && label.value() == "prices")
        })
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(count) => count,
            other => panic!("stale events metric is not a counter: {other:?}"),
        })
        .sum();
    assert_eq!(stale, 1);

    node.bus.stop().unwrap();
}
