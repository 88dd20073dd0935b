//! Prometheus metrics registry and instruments.
//!
//! Instruments are usable before `init_metrics` runs; registration only
//! makes them visible to `gather`.

use std::sync::Once;

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Database Metrics
    pub static ref DB_QUERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tootvault_db_queries_total", "Total number of database queries"),
        &["operation", "table"]
    ).expect("metric can be created");

    // Cache Metrics
    pub static ref CACHE_HITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tootvault_cache_hits_total", "Total number of cache hits"),
        &["cache_name"]
    ).expect("metric can be created");
    pub static ref CACHE_MISSES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tootvault_cache_misses_total", "Total number of cache misses"),
        &["cache_name"]
    ).expect("metric can be created");
    pub static ref CACHE_SIZE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("tootvault_cache_size", "Current number of items in cache"),
        &["cache_name"]
    ).expect("metric can be created");

    // Lock Metrics
    pub static ref KEY_LOCK_WAITS_TOTAL: IntCounter = IntCounter::new(
        "tootvault_key_lock_waits_total",
        "Total number of times a key lock acquisition had to wait"
    ).expect("metric can be created");

    // Queue Metrics
    pub static ref STATUS_EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tootvault_status_events_total", "Total number of status side-effect events"),
        &["action", "outcome"]
    ).expect("metric can be created");
}

static INIT: Once = Once::new();

/// Initialize metrics registry.
///
/// Safe to call more than once.
pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(DB_QUERIES_TOTAL.clone()))
            .expect("DB_QUERIES_TOTAL can be registered");
        REGISTRY
            .register(Box::new(CACHE_HITS_TOTAL.clone()))
            .expect("CACHE_HITS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(CACHE_MISSES_TOTAL.clone()))
            .expect("CACHE_MISSES_TOTAL can be registered");
        REGISTRY
            .register(Box::new(CACHE_SIZE.clone()))
            .expect("CACHE_SIZE can be registered");
        REGISTRY
            .register(Box::new(KEY_LOCK_WAITS_TOTAL.clone()))
            .expect("KEY_LOCK_WAITS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(STATUS_EVENTS_TOTAL.clone()))
            .expect("STATUS_EVENTS_TOTAL can be registered");

        tracing::info!("Metrics registry initialized");
    });
}

/// Render every registered metric in the Prometheus text format.
pub fn gather() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
