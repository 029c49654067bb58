//! Prometheus-backed telemetry sink.

use super::{Tags, TelemetrySink};
use dashmap::DashMap;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

/// Latency-style buckets, in seconds
const DEFAULT_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Telemetry sink that records into an instance-owned Prometheus registry.
///
/// Metric vectors are created the first time a name is seen; the tag keys of
/// that first call fix the label set. Later calls with a different key set
/// are dropped with a debug log.
pub struct PrometheusTelemetry {
    namespace: String,
    registry: Registry,
    counters: DashMap<String, (CounterVec, Vec<String>)>,
    histograms: DashMap<String, (HistogramVec, Vec<String>)>,
}

impl PrometheusTelemetry {
    /// Create a sink with its own registry
    pub fn new(namespace: impl Into<String>) -> Self {
        Self::with_registry(namespace, Registry::new())
    }

    /// Create a sink that registers into an existing registry
    pub fn with_registry(namespace: impl Into<String>, registry: Registry) -> Self {
        Self {
            namespace: sanitize(&namespace.into()),
            registry,
            counters: DashMap::new(),
            histograms: DashMap::new(),
        }
    }

    /// Get the underlying registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    fn counter_vec(&self, name: &str, keys: &[String]) -> Option<CounterVec> {
        if let Some(entry) = self.counters.get(name) {
            return (entry.1 == keys).then(|| entry.0.clone());
        }

        let labels: Vec<&str> = keys.iter().map(String::as_str).collect();
        let vec = CounterVec::new(
            Opts::new(sanitize(name), format!("Counter {}", name)).namespace(self.namespace.clone()),
            &labels,
        )
        .map_err(|e| tracing::debug!(metric = name, error = %e, "Invalid counter definition"))
        .ok()?;

        let entry = self
            .counters
            .entry(name.to_string())
            .or_insert_with(|| {
                if let Err(e) = self.registry.register(Box::new(vec.clone())) {
                    tracing::debug!(metric = name, error = %e, "Failed to register counter");
                }
                (vec, keys.to_vec())
            });
        (entry.1 == keys).then(|| entry.0.clone())
    }

    fn histogram_vec(&self, name: &str, keys: &[String]) -> Option<HistogramVec> {
        if let Some(entry) = self.histograms.get(name) {
            return (entry.1 == keys).then(|| entry.0.clone());
        }

        let labels: Vec<&str> = keys.iter().map(String::as_str).collect();
        let vec = HistogramVec::new(
            HistogramOpts::new(sanitize(name), format!("Histogram {}", name))
                .namespace(self.namespace.clone())
                .buckets(DEFAULT_BUCKETS.to_vec()),
            &labels,
        )
        .map_err(|e| tracing::debug!(metric = name, error = %e, "Invalid histogram definition"))
        .ok()?;

        let entry = self
            .histograms
            .entry(name.to_string())
            .or_insert_with(|| {
                if let Err(e) = self.registry.register(Box::new(vec.clone())) {
                    tracing::debug!(metric = name, error = %e, "Failed to register histogram");
                }
                (vec, keys.to_vec())
            });
        (entry.1 == keys).then(|| entry.0.clone())
    }
}

impl TelemetrySink for PrometheusTelemetry {
    fn counter(&self, name: &str, tags: Tags<'_>) {
        let (keys, values) = split_tags(tags);
        match self.counter_vec(name, &keys) {
            Some(vec) => {
                let values: Vec<&str> = values.iter().copied().collect();
                if let Ok(counter) = vec.get_metric_with_label_values(&values) {
                    counter.inc();
                }
            }
            None => tracing::debug!(metric = name, "Dropping counter with mismatched tags"),
        }
    }

    fn histogram(&self, name: &str, value: f64, tags: Tags<'_>) {
        let (keys, values) = split_tags(tags);
        match self.histogram_vec(name, &keys) {
            Some(vec) => {
                let values: Vec<&str> = values.iter().copied().collect();
                if let Ok(histogram) = vec.get_metric_with_label_values(&values) {
                    histogram.observe(value);
                }
            }
            None => tracing::debug!(metric = name, "Dropping histogram with mismatched tags"),
        }
    }
}

/// Sort tags by key so label order is stable across call sites
fn split_tags<'a>(tags: Tags<'a>) -> (Vec<String>, Vec<&'a str>) {
    let mut sorted: Vec<(&str, &str)> = tags.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let keys = sorted.iter().map(|(k, _)| sanitize(k)).collect();
    let values = sorted.iter().map(|(_, v)| *v).collect();
    (keys, values)
}

/// Map a dotted metric name onto the Prometheus name alphabet
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}
