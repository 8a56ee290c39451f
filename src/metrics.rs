//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounterVec, IntGaugeVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Worker metrics
    pub static ref CONSUMER_RUNTIME_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "comet_consumer_runtime_seconds",
            "Time spent processing one delivery"
        ).buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["queue"]
    ).expect("metric can be created");
    pub static ref DEQUEUE_LATENCY_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "comet_dequeue_latency_seconds",
            "Observed queue age derived from residual lock TTL"
        ).buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
        &["queue"]
    ).expect("metric can be created");

    // Delivery metrics
    pub static ref NOTIFICATIONS_SENT_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("comet_notifications_sent_total", "Push notifications accepted by APNs"),
        &["kind"]
    ).expect("metric can be created");
    pub static ref NOTIFICATIONS_FAILED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("comet_notifications_failed_total", "Push notifications rejected or errored"),
        &["kind", "permanent"]
    ).expect("metric can be created");

    // Upstream metrics
    pub static ref UPSTREAM_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("comet_upstream_requests_total", "Upstream API requests by outcome"),
        &["endpoint", "outcome"]
    ).expect("metric can be created");

    // Enqueuer metrics
    pub static ref ITEMS_ENQUEUED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("comet_items_enqueued_total", "Work items published per queue"),
        &["queue"]
    ).expect("metric can be created");
    pub static ref ITEMS_SKIPPED_LOCKED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("comet_items_skipped_locked_total", "Due items skipped because the lock was held"),
        &["queue"]
    ).expect("metric can be created");
    pub static ref QUEUE_READY_DEPTH: IntGaugeVec = IntGaugeVec::new(
        Opts::new("comet_queue_ready_depth", "Items waiting in the ready list"),
        &["queue"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(CONSUMER_RUNTIME_SECONDS.clone()))
        .expect("CONSUMER_RUNTIME_SECONDS can be registered");
    REGISTRY
        .register(Box::new(DEQUEUE_LATENCY_SECONDS.clone()))
        .expect("DEQUEUE_LATENCY_SECONDS can be registered");
    REGISTRY
        .register(Box::new(NOTIFICATIONS_SENT_TOTAL.clone()))
        .expect("NOTIFICATIONS_SENT_TOTAL can be registered");
    REGISTRY
        .register(Box::new(NOTIFICATIONS_FAILED_TOTAL.clone()))
        .expect("NOTIFICATIONS_FAILED_TOTAL can be registered");
    REGISTRY
        .register(Box::new(UPSTREAM_REQUESTS_TOTAL.clone()))
        .expect("UPSTREAM_REQUESTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(ITEMS_ENQUEUED_TOTAL.clone()))
        .expect("ITEMS_ENQUEUED_TOTAL can be registered");
    REGISTRY
        .register(Box::new(ITEMS_SKIPPED_LOCKED_TOTAL.clone()))
        .expect("ITEMS_SKIPPED_LOCKED_TOTAL can be registered");
    REGISTRY
        .register(Box::new(QUEUE_READY_DEPTH.clone()))
        .expect("QUEUE_READY_DEPTH can be registered");

    tracing::info!("Metrics registry initialized");
}

/// Render the registry in the Prometheus text exposition format.
pub fn gather() -> String {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(error) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!(%error, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
