//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use std::sync::Once;

use lazy_static::lazy_static;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Queue Metrics
    pub static ref ACTIVITIES_ENQUEUED: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcourier_activities_enqueued_total", "Total number of activities queued for delivery"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref QUEUE_TRANSITIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcourier_queue_transitions_total", "Queue message state transitions"),
        &["to_state"]
    ).expect("metric can be created");

    pub static ref QUEUE_DEPTH: IntGaugeVec = IntGaugeVec::new(
        Opts::new("fedcourier_queue_depth", "Messages currently held in each queue state"),
        &["state"]
    ).expect("metric can be created");

    // Delivery Metrics
    pub static ref DELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcourier_deliveries_total", "Total number of delivery attempts"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref DELIVERY_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "fedcourier_delivery_duration_seconds",
            "Outbound delivery duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref RETRY_SWEEP_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcourier_retry_sweep_messages_total", "Messages handled by the retry sweeper"),
        &["result"]
    ).expect("metric can be created");

    // Signature Metrics
    pub static ref SIGNATURE_VERIFICATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcourier_signature_verifications_total", "Inbound signature verification results"),
        &["result"]
    ).expect("metric can be created");
    pub static ref KEY_CACHE_LOOKUPS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcourier_key_cache_lookups_total", "Public key cache lookups"),
        &["result"]
    ).expect("metric can be created");
    pub static ref KEY_FETCHES_TOTAL: IntCounter = IntCounter::new(
        "fedcourier_key_fetches_total",
        "Remote actor documents fetched for public keys"
    ).expect("metric can be created");

    // Inbox Metrics
    pub static ref INBOX_ACTIVITIES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcourier_inbox_activities_received_total", "Verified activities accepted at the inbox"),
        &["activity_type"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedcourier_errors_total", "Total number of errors returned to HTTP callers"),
        &["error_type"]
    ).expect("metric can be created");
}

static INIT: Once = Once::new();

/// Initialize metrics registry.
///
/// Safe to call more than once; only the first call registers.
pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(ACTIVITIES_ENQUEUED.clone()))
            .expect("ACTIVITIES_ENQUEUED can be registered");
        REGISTRY
            .register(Box::new(QUEUE_TRANSITIONS_TOTAL.clone()))
            .expect("QUEUE_TRANSITIONS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(QUEUE_DEPTH.clone()))
            .expect("QUEUE_DEPTH can be registered");
        REGISTRY
            .register(Box::new(DELIVERIES_TOTAL.clone()))
            .expect("DELIVERIES_TOTAL can be registered");
        REGISTRY
            .register(Box::new(DELIVERY_DURATION_SECONDS.clone()))
            .expect("DELIVERY_DURATION_SECONDS can be registered");
        REGISTRY
            .register(Box::new(RETRY_SWEEP_TOTAL.clone()))
            .expect("RETRY_SWEEP_TOTAL can be registered");
        REGISTRY
            .register(Box::new(SIGNATURE_VERIFICATIONS_TOTAL.clone()))
            .expect("SIGNATURE_VERIFICATIONS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(KEY_CACHE_LOOKUPS_TOTAL.clone()))
            .expect("KEY_CACHE_LOOKUPS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(KEY_FETCHES_TOTAL.clone()))
            .expect("KEY_FETCHES_TOTAL can be registered");
        REGISTRY
            .register(Box::new(INBOX_ACTIVITIES_RECEIVED.clone()))
            .expect("INBOX_ACTIVITIES_RECEIVED can be registered");
        REGISTRY
            .register(Box::new(ERRORS_TOTAL.clone()))
            .expect("ERRORS_TOTAL can be registered");

        tracing::info!("Metrics registry initialized");
    });
}
