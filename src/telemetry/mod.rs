//! Telemetry plumbing for the pipeline.
//!
//! Components report counters and histograms through the [`TelemetrySink`]
//! trait. Sinks are fire-and-forget: recording a metric never returns an
//! error to the caller, so a broken exporter can not fail a publish or a
//! consume.
//!
//! # Example
//!
//! ```no_run
//! use resilient_messaging::telemetry::{PrometheusTelemetry, TelemetrySink};
//!
//! let telemetry = PrometheusTelemetry::new("resilient_messaging");
//! telemetry.counter("messaging.publish.count", &[("destination", "orders"), ("outcome", "ok")]);
//! println!("{}", telemetry.export());
//! ```

mod prometheus_sink;

pub use prometheus_sink::PrometheusTelemetry;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Metric tags as key/value pairs
pub type Tags<'a> = &'a [(&'a str, &'a str)];

/// Destination for counters and histograms emitted by the pipeline
pub trait TelemetrySink: Send + Sync {
    /// Increment a counter by one
    fn counter(&self, name: &str, tags: Tags<'_>);

    /// Record a single observation
    fn histogram(&self, name: &str, value: f64, tags: Tags<'_>);
}

/// Sink that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn counter(&self, _name: &str, _tags: Tags<'_>) {}

    fn histogram(&self, _name: &str, _value: f64, _tags: Tags<'_>) {}
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `default_filter`. Returns an error if a
/// subscriber was already installed.
pub fn init_tracing(
    default_filter: &str,
    json: bool,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    }
}
