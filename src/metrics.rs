//! Metrics and telemetry for the rollup engine
//!
//! Prometheus metrics for ingestion, flush and query. Recording can be
//! switched off at runtime with [`set_enabled`]; the registry itself is
//! process global.

use std::sync::atomic::{AtomicBool, Ordering};

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram, register_histogram_vec, CounterVec,
    Encoder, Gauge, Histogram, HistogramVec, TextEncoder,
};

static ENABLED: AtomicBool = AtomicBool::new(true);

lazy_static! {
    // === Counters ===

    /// Ingested events by outcome
    pub static ref EVENTS_TOTAL: CounterVec = register_counter_vec!(
        "rollup_events_total",
        "Events offered to the aggregator",
        &["status"]
    ).unwrap();

    /// Per-rule accumulator updates by aggregation type and outcome
    pub static ref RULE_UPDATES_TOTAL: CounterVec = register_counter_vec!(
        "rollup_rule_updates_total",
        "Rule evaluations during ingestion",
        &["aggregation", "outcome"]
    ).unwrap();

    /// Finalized bucket writes by outcome
    pub static ref FLUSHED_BUCKETS_TOTAL: CounterVec = register_counter_vec!(
        "rollup_flushed_buckets_total",
        "Finalized bucket writes",
        &["outcome"]
    ).unwrap();

    /// Errors by type and operation
    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "rollup_errors_total",
        "Errors by type and operation",
        &["error_type", "operation"]
    ).unwrap();

    // === Latency Histograms ===

    /// Collector pass duration
    pub static ref FLUSH_DURATION: Histogram = register_histogram!(
        "rollup_flush_duration_seconds",
        "Collector pass latency in seconds",
        vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0]
    ).unwrap();

    /// Query duration by analysis type
    pub static ref QUERY_DURATION: HistogramVec = register_histogram_vec!(
        "rollup_query_duration_seconds",
        "Query latency in seconds",
        &["analysis"],
        vec![0.0001, 0.001, 0.01, 0.1, 0.5, 1.0]
    ).unwrap();

    // === Gauges ===

    /// Live accumulator slots
    pub static ref LIVE_SLOTS: Gauge = register_gauge!(
        "rollup_live_slots",
        "Accumulator slots not yet flushed"
    ).unwrap();
}

/// Turn metric recording on or off
pub fn set_enabled(enabled: bool) {
    ENABLED.store(enabled, Ordering::Relaxed);
}

#[inline]
fn enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// Get metrics in Prometheus text format
pub fn gather_metrics() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Metrics contain invalid UTF-8: {}", e))
}

/// Record one event offered to the aggregator
#[inline]
pub fn record_event(status: &str) {
    if enabled() {
        EVENTS_TOTAL.with_label_values(&[status]).inc();
    }
}

/// Record one rule evaluation
#[inline]
pub fn record_rule_update(aggregation: &str, outcome: &str) {
    if enabled() {
        RULE_UPDATES_TOTAL
            .with_label_values(&[aggregation, outcome])
            .inc();
    }
}

/// Record finalized bucket writes
#[inline]
pub fn record_flushed_buckets(outcome: &str, count: usize) {
    if enabled() && count > 0 {
        FLUSHED_BUCKETS_TOTAL
            .with_label_values(&[outcome])
            .inc_by(count as f64);
    }
}

/// Record a collector pass
#[inline]
pub fn record_flush(duration_secs: f64) {
    if enabled() {
        FLUSH_DURATION.observe(duration_secs);
    }
}

/// Record a query
#[inline]
pub fn record_query(analysis: &str, duration_secs: f64) {
    if enabled() {
        QUERY_DURATION
            .with_label_values(&[analysis])
            .observe(duration_secs);
    }
}

/// Record an error
#[inline]
pub fn record_error(error_type: &str, operation: &str) {
    if enabled() {
        ERRORS_TOTAL
            .with_label_values(&[error_type, operation])
            .inc();
    }
}

/// Update the live slot gauge
#[inline]
pub fn update_live_slots(count: usize) {
    if enabled() {
        LIVE_SLOTS.set(count as f64);
    }
}
