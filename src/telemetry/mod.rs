//! Tracing subscriber installation and metric descriptions.

mod catalog;

use std::sync::Once;

use metrics::{describe_counter, describe_gauge, describe_histogram};
use thiserror::Error;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

pub use catalog::{BusMetric, MetricKind};

static METRIC_DESCRIPTIONS: Once = Once::new();

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), TelemetryError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| TelemetryError::Subscriber(err.to_string()))
}

/// Register descriptions of every [`BusMetric`] with the installed recorder.
///
/// Runs once per process; later calls are no-ops.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        for metric in BusMetric::ALL {
            match metric.kind() {
                MetricKind::Counter => {
                    describe_counter!(metric.id(), metric.unit(), metric.description())
                }
                MetricKind::Gauge => {
                    describe_gauge!(metric.id(), metric.unit(), metric.description())
                }
                MetricKind::Histogram => {
                    describe_histogram!(metric.id(), metric.unit(), metric.description())
                }
            }
        }
    });
}
