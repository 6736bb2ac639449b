//! Metrics emission through an injected sink.
//!
//! Components never touch a process-wide registry; each one receives an
//! `Arc<dyn MetricsSink>` at construction and labels every point with the
//! chain id. [`OtelMetrics`] records through OpenTelemetry instruments and
//! can be exported via OTLP to Prometheus, Grafana, Datadog, etc.
//!
//! ## Emitted metrics
//! - `head_tracker_heads_received`: counter, tagged with chain_id
//! - `head_tracker_connection_errors`: counter, tagged with chain_id
//! - `head_tracker_current_head`: gauge, tagged with chain_id
//! - `head_tracker_very_old_head`: counter, tagged with chain_id
//! - `head_tracker_backfill_duration_seconds`: histogram, tagged with chain_id
//! - `mailbox_load_percent`: gauge, tagged with mailbox name

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::{
    metrics::{Counter, Gauge, Histogram, Meter},
    KeyValue,
};

pub const HEADS_RECEIVED: &str = "head_tracker_heads_received";
pub const CONNECTION_ERRORS: &str = "head_tracker_connection_errors";
pub const CURRENT_HEAD: &str = "head_tracker_current_head";
pub const VERY_OLD_HEAD: &str = "head_tracker_very_old_head";
pub const BACKFILL_DURATION: &str = "head_tracker_backfill_duration_seconds";
pub const MAILBOX_LOAD_PERCENT: &str = "mailbox_load_percent";

/// A label attached to a metric point.
pub type Label = (&'static str, String);

/// Destination for metric points.
pub trait MetricsSink: Send + Sync {
    /// Increment the counter `name` by one.
    fn increment_counter(&self, name: &'static str, labels: &[Label]);

    /// Set the gauge `name` to `value`.
    fn set_gauge(&self, name: &'static str, value: f64, labels: &[Label]);

    /// Record one sample of the histogram `name`.
    fn observe(&self, name: &'static str, value: f64, labels: &[Label]);
}

/// Discards every point.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment_counter(&self, _name: &'static str, _labels: &[Label]) {}

    fn set_gauge(&self, _name: &'static str, _value: f64, _labels: &[Label]) {}

    fn observe(&self, _name: &'static str, _value: f64, _labels: &[Label]) {}
}

/// OpenTelemetry-backed sink built from an injected [`Meter`].
///
/// Known series get their instrument at construction. Any other name is
/// built on demand; the SDK deduplicates instruments by name.
#[derive(Clone)]
pub struct OtelMetrics {
    meter: Meter,
    pub heads_received: Counter<u64>,
    pub connection_errors: Counter<u64>,
    pub very_old_head: Counter<u64>,
    pub current_head: Gauge<f64>,
    pub mailbox_load_percent: Gauge<f64>,
    pub backfill_duration: Histogram<f64>,
}

impl OtelMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            meter: meter.clone(),
            heads_received: meter
                .u64_counter(HEADS_RECEIVED)
                .with_description("Valid heads received from the new-heads subscription")
                .build(),
            connection_errors: meter
                .u64_counter(CONNECTION_ERRORS)
                .with_description("Failed attempts to subscribe to new heads")
                .build(),
            very_old_head: meter
                .u64_counter(VERY_OLD_HEAD)
                .with_description("Heads older than the finality window below the highest head")
                .build(),
            current_head: meter
                .f64_gauge(CURRENT_HEAD)
                .with_description("Number of the current highest head")
                .build(),
            mailbox_load_percent: meter
                .f64_gauge(MAILBOX_LOAD_PERCENT)
                .with_description("Mailbox fill level as a percentage of capacity")
                .build(),
            backfill_duration: meter
                .f64_histogram(BACKFILL_DURATION)
                .with_description("Wall time of one backfill pass")
                .with_unit("s")
                .build(),
        }
    }
}

impl MetricsSink for OtelMetrics {
    fn increment_counter(&self, name: &'static str, labels: &[Label]) {
        let attributes = key_values(labels);
        match name {
            HEADS_RECEIVED => self.heads_received.add(1, &attributes),
            CONNECTION_ERRORS => self.connection_errors.add(1, &attributes),
            VERY_OLD_HEAD => self.very_old_head.add(1, &attributes),
            other => self.meter.u64_counter(other).build().add(1, &attributes),
        }
    }

    fn set_gauge(&self, name: &'static str, value: f64, labels: &[Label]) {
        let attributes = key_values(labels);
        match name {
            CURRENT_HEAD => self.current_head.record(value, &attributes),
            MAILBOX_LOAD_PERCENT => self.mailbox_load_percent.record(value, &attributes),
            other => self.meter.f64_gauge(other).build().record(value, &attributes),
        }
    }

    fn observe(&self, name: &'static str, value: f64, labels: &[Label]) {
        let attributes = key_values(labels);
        match name {
            BACKFILL_DURATION => self.backfill_duration.record(value, &attributes),
            other => self.meter.f64_histogram(other).build().record(value, &attributes),
        }
    }
}

fn key_values(labels: &[Label]) -> Vec<KeyValue> {
    labels
        .iter()
        .map(|(key, value)| KeyValue::new(*key, value.clone()))
        .collect()
}

/// Head tracker metrics bound to one chain.
#[derive(Clone)]
pub struct HeadTrackerMetrics {
    sink: Arc<dyn MetricsSink>,
    chain_id: String,
}

impl HeadTrackerMetrics {
    pub fn new(sink: Arc<dyn MetricsSink>, chain_id: impl Into<String>) -> Self {
        Self {
            sink,
            chain_id: chain_id.into(),
        }
    }

    /// Metrics that go nowhere.
    pub fn noop(chain_id: impl Into<String>) -> Self {
        Self::new(Arc::new(NoopMetrics), chain_id)
    }

    /// The underlying sink, for components that emit their own series.
    pub fn sink(&self) -> Arc<dyn MetricsSink> {
        self.sink.clone()
    }

    fn labels(&self) -> [Label; 1] {
        [("chain_id", self.chain_id.clone())]
    }

    pub fn record_head_received(&self) {
        self.sink.increment_counter(HEADS_RECEIVED, &self.labels());
    }

    pub fn record_connection_error(&self) {
        self.sink.increment_counter(CONNECTION_ERRORS, &self.labels());
    }

    pub fn set_current_head(&self, number: u64) {
        self.sink.set_gauge(CURRENT_HEAD, number as f64, &self.labels());
    }

    pub fn record_very_old_head(&self) {
        self.sink.increment_counter(VERY_OLD_HEAD, &self.labels());
    }

    pub fn record_backfill_duration(&self, elapsed: Duration) {
        self.sink
            .observe(BACKFILL_DURATION, elapsed.as_secs_f64(), &self.labels());
    }
}
