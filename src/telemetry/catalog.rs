//! Closed catalogue of the metrics the bus emits.

use metrics::Unit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

/// Every metric the bus emits, labelled by cache or component where noted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusMetric {
    EventsSent,
    EventsFiltered,
    EventsSuppressed,
    EventsReceived,
    EventsApplied,
    StaleEvents,
    DecodeErrors,
    ApplyFailures,
    ProduceErrors,
    ProduceLatency,
    DroppedMessages,
    RingBufferFull,
    RingReadCursor,
    RingWriteCursor,
    WorkerFailures,
    RecoveryAttempts,
    RecoveryFailures,
    TimestampCleanups,
    TimestampEntries,
}

impl BusMetric {
    pub const ALL: [BusMetric; 19] = [
        Self::EventsSent,
        Self::EventsFiltered,
        Self::EventsSuppressed,
        Self::EventsReceived,
        Self::EventsApplied,
        Self::StaleEvents,
        Self::DecodeErrors,
        Self::ApplyFailures,
        Self::ProduceErrors,
        Self::ProduceLatency,
        Self::DroppedMessages,
        Self::RingBufferFull,
        Self::RingReadCursor,
        Self::RingWriteCursor,
        Self::WorkerFailures,
        Self::RecoveryAttempts,
        Self::RecoveryFailures,
        Self::TimestampCleanups,
        Self::TimestampEntries,
    ];

    pub const fn id(self) -> &'static str {
        match self {
            Self::EventsSent => "cachebus_events_sent_total",
            Self::EventsFiltered => "cachebus_events_filtered_total",
            Self::EventsSuppressed => "cachebus_events_suppressed_total",
            Self::EventsReceived => "cachebus_events_received_total",
            Self::EventsApplied => "cachebus_events_applied_total",
            Self::StaleEvents => "cachebus_events_stale_total",
            Self::DecodeErrors => "cachebus_decode_errors_total",
            Self::ApplyFailures => "cachebus_apply_failures_total",
            Self::ProduceErrors => "cachebus_produce_errors_total",
            Self::ProduceLatency => "cachebus_produce_ms",
            Self::DroppedMessages => "cachebus_messages_dropped_total",
            Self::RingBufferFull => "cachebus_ring_full_total",
            Self::RingReadCursor => "cachebus_ring_read_cursor",
            Self::RingWriteCursor => "cachebus_ring_write_cursor",
            Self::WorkerFailures => "cachebus_worker_failures_total",
            Self::RecoveryAttempts => "cachebus_recovery_attempts_total",
            Self::RecoveryFailures => "cachebus_recovery_failures_total",
            Self::TimestampCleanups => "cachebus_timestamp_cleanups_total",
            Self::TimestampEntries => "cachebus_timestamp_entries",
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::EventsSent => "Total number of events handed to the message channel.",
            Self::EventsFiltered => "Total number of local events not propagated for their cache type.",
            Self::EventsSuppressed => "Total number of remote-origin events kept from being re-sent.",
            Self::EventsReceived => "Total number of messages delivered by the message channel.",
            Self::EventsApplied => "Total number of remote events applied to a local cache.",
            Self::StaleEvents => "Total number of remote events rejected by timestamp comparison.",
            Self::DecodeErrors => "Total number of received messages that failed to deserialize.",
            Self::ApplyFailures => "Total number of remote events that could not be applied.",
            Self::ProduceErrors => "Total number of events the producer failed to send.",
            Self::ProduceLatency => "Latency of a single channel send in milliseconds.",
            Self::DroppedMessages => "Total number of items dropped because the pipeline was closed.",
            Self::RingBufferFull => "Total number of offers that found their ring buffer stripe full.",
            Self::RingReadCursor => "Read cursor of a ring buffer stripe.",
            Self::RingWriteCursor => "Write cursor of a ring buffer stripe.",
            Self::WorkerFailures => "Total number of stripe workers that terminated permanently.",
            Self::RecoveryAttempts => "Total number of channel recovery attempts.",
            Self::RecoveryFailures => "Total number of channel recoveries that gave up.",
            Self::TimestampCleanups => "Total number of timestamp store cleanups.",
            Self::TimestampEntries => "Current number of timestamp records of a cache.",
        }
    }

    pub const fn kind(self) -> MetricKind {
        match self {
            Self::ProduceLatency => MetricKind::Histogram,
            Self::RingReadCursor | Self::RingWriteCursor | Self::TimestampEntries => MetricKind::Gauge,
            _ => MetricKind::Counter,
        }
    }

    pub const fn unit(self) -> Unit {
        match self {
            Self::ProduceLatency => Unit::Milliseconds,
            _ => Unit::Count,
        }
    }
}
