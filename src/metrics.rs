// src/metrics.rs

#[cfg(feature = "observability")]
pub use ::metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};

// NOTE: When observability feature is disabled, provide stub implementations
#[cfg(not(feature = "observability"))]
pub enum Unit {}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! counter {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! gauge {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! histogram {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_counter {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_gauge {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_histogram {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
use crate::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Registers descriptions for every metric the gateway emits.
/// Call once at startup, after the exporter is installed.
pub fn describe_metrics() {
    describe_counter!(
        "cache_hits_total",
        Unit::Count,
        "Lookups answered from a fresh cache entry, labeled by cache."
    );
    describe_counter!(
        "cache_miss_total",
        Unit::Count,
        "Lookups that found no fresh cache entry, labeled by cache."
    );
    describe_counter!(
        "cache_coalesced_waits_total",
        Unit::Count,
        "Lookups that attached to another caller's in-flight computation."
    );
    describe_gauge!("cache_size_gauge", "Number of entries held by a cache, including expired ones.");
    describe_counter!(
        "upstream_calls_total",
        Unit::Count,
        "Upstream RPC calls, labeled by method and outcome."
    );
    describe_histogram!(
        "upstream_call_latency_seconds",
        Unit::Seconds,
        "Upstream RPC call latency, labeled by method."
    );
    describe_counter!(
        "rate_limit_rejections_total",
        Unit::Count,
        "Requests rejected by the per-client rate limiter."
    );
    describe_histogram!("balance_batch_size", "Number of unique wallets per accepted batch.");
    describe_counter!(
        "fan_out_deadline_exceeded_total",
        Unit::Count,
        "Keys abandoned because the request deadline passed."
    );
    describe_counter!("http_panics_total", Unit::Count, "Handler panics caught by the HTTP layer.");
}

// --- Helper functions to update metrics ---

pub fn increment_cache_hit(cache_name: &str) {
    counter!("cache_hits_total", 1, "cache" => cache_name.to_string());
}

pub fn increment_cache_miss(cache_name: &str) {
    counter!("cache_miss_total", 1, "cache" => cache_name.to_string());
}

pub fn increment_coalesced_wait(cache_name: &str) {
    counter!("cache_coalesced_waits_total", 1, "cache" => cache_name.to_string());
}

pub fn set_cache_size(cache_name: &str, size: f64) {
    gauge!("cache_size_gauge", size, "cache" => cache_name.to_string());
}

pub fn increment_upstream_call(method: &str, outcome: &'static str) {
    counter!("upstream_calls_total", 1, "method" => method.to_string(), "outcome" => outcome);
}

pub fn record_upstream_latency(method: &str, duration: std::time::Duration) {
    histogram!("upstream_call_latency_seconds", duration.as_secs_f64(), "method" => method.to_string());
}

pub fn increment_rate_limited() {
    counter!("rate_limit_rejections_total", 1);
}

pub fn record_batch_size(size: usize) {
    histogram!("balance_batch_size", size as f64);
}

pub fn increment_deadline_exceeded(count: u64) {
    counter!("fan_out_deadline_exceeded_total", count);
}

pub fn increment_http_panics() {
    counter!("http_panics_total", 1);
}

/// Installs the Prometheus scrape endpoint on `0.0.0.0:port`.
#[cfg(feature = "observability")]
pub fn install_exporter(port: u16) -> anyhow::Result<()> {
    let addr: std::net::SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    describe_metrics();
    log::info!("Prometheus exporter listening on {}", addr);
    Ok(())
}

#[cfg(not(feature = "observability"))]
pub fn install_exporter(_port: u16) -> anyhow::Result<()> {
    log::debug!("observability feature disabled, metrics exporter not installed");
    Ok(())
}
