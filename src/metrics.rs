//! Prometheus metrics for the interceptor toolkit.
//!
//! Metrics are exposed via a dedicated HTTP endpoint (default port: 9090).
//! All method labels use the short method key (`Type#operation`) to keep
//! label length and cardinality bounded; rate-limit metrics additionally tag
//! the subject *type* (`apiKey` | `user` | `ip` | `unknown`), never the
//! subject identity.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `proxy_toolkit_ratelimit_allowed_total` (method, subject)
//! - `proxy_toolkit_ratelimit_rejected_total` (method, subject)
//! - `proxy_toolkit_retry_calls_total` (method)
//! - `proxy_toolkit_retry_attempts_total` (method)
//! - `proxy_toolkit_retry_exhausted_total` (method)
//! - `proxy_toolkit_cache_hits_total` (cache, method)
//! - `proxy_toolkit_cache_misses_total` (cache, method)
//! - `proxy_toolkit_idempotency_served_total` (method)
//! - `proxy_toolkit_idempotency_executed_total` (method)
//! - `proxy_toolkit_idempotency_inflight_conflict_total` (method)
//!
//! ## Histograms
//! - `proxy_toolkit_call_duration_seconds` (method, status)
//! - `proxy_toolkit_retry_duration_seconds` (method)

use std::net::SocketAddr;

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const RATELIMIT_ALLOWED_TOTAL: &str = "proxy_toolkit_ratelimit_allowed_total";
    pub const RATELIMIT_REJECTED_TOTAL: &str = "proxy_toolkit_ratelimit_rejected_total";
    pub const RETRY_CALLS_TOTAL: &str = "proxy_toolkit_retry_calls_total";
    pub const RETRY_ATTEMPTS_TOTAL: &str = "proxy_toolkit_retry_attempts_total";
    pub const RETRY_EXHAUSTED_TOTAL: &str = "proxy_toolkit_retry_exhausted_total";
    pub const CACHE_HITS_TOTAL: &str = "proxy_toolkit_cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "proxy_toolkit_cache_misses_total";
    pub const IDEMPOTENCY_SERVED_TOTAL: &str = "proxy_toolkit_idempotency_served_total";
    pub const IDEMPOTENCY_EXECUTED_TOTAL: &str = "proxy_toolkit_idempotency_executed_total";
    pub const IDEMPOTENCY_INFLIGHT_CONFLICT_TOTAL: &str =
        "proxy_toolkit_idempotency_inflight_conflict_total";
    pub const CALL_DURATION_SECONDS: &str = "proxy_toolkit_call_duration_seconds";
    pub const RETRY_DURATION_SECONDS: &str = "proxy_toolkit_retry_duration_seconds";
}

/// Initialize the Prometheus metrics exporter and describe all metrics.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::RATELIMIT_ALLOWED_TOTAL,
        "Calls allowed by the rate-limit stage"
    );
    describe_counter!(
        names::RATELIMIT_REJECTED_TOTAL,
        "Calls rejected by the rate-limit stage"
    );
    describe_counter!(
        names::RETRY_CALLS_TOTAL,
        "Operations entering the retry stage"
    );
    describe_counter!(
        names::RETRY_ATTEMPTS_TOTAL,
        "Individual attempts made by the retry stage"
    );
    describe_counter!(
        names::RETRY_EXHAUSTED_TOTAL,
        "Operations whose retry budget was exhausted"
    );
    describe_counter!(names::CACHE_HITS_TOTAL, "Cache stage hits");
    describe_counter!(names::CACHE_MISSES_TOTAL, "Cache stage misses");
    describe_counter!(
        names::IDEMPOTENCY_SERVED_TOTAL,
        "Requests served from a stored idempotent response"
    );
    describe_counter!(
        names::IDEMPOTENCY_EXECUTED_TOTAL,
        "Requests that executed the business path under an idempotency key"
    );
    describe_counter!(
        names::IDEMPOTENCY_INFLIGHT_CONFLICT_TOTAL,
        "Requests rejected because another owner was still in flight"
    );

    describe_histogram!(
        names::CALL_DURATION_SECONDS,
        "Wall-clock duration of intercepted operations"
    );
    describe_histogram!(
        names::RETRY_DURATION_SECONDS,
        "Wall-clock duration spent inside the retry stage"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging errors without failing startup.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// Rate limiting
// =============================================================================

pub fn record_rate_limit_allowed(method: &str, subject_type: &str) {
    counter!(names::RATELIMIT_ALLOWED_TOTAL, "method" => method.to_string(), "subject" => subject_type.to_string())
        .increment(1);
}

pub fn record_rate_limit_rejected(method: &str, subject_type: &str) {
    counter!(names::RATELIMIT_REJECTED_TOTAL, "method" => method.to_string(), "subject" => subject_type.to_string())
        .increment(1);
}

// =============================================================================
// Retry
// =============================================================================

pub fn record_retry_call(method: &str) {
    counter!(names::RETRY_CALLS_TOTAL, "method" => method.to_string()).increment(1);
}

pub fn record_retry_attempt(method: &str) {
    counter!(names::RETRY_ATTEMPTS_TOTAL, "method" => method.to_string()).increment(1);
}

pub fn record_retry_exhausted(method: &str) {
    counter!(names::RETRY_EXHAUSTED_TOTAL, "method" => method.to_string()).increment(1);
}

pub fn record_retry_duration(method: &str, duration_secs: f64) {
    histogram!(names::RETRY_DURATION_SECONDS, "method" => method.to_string())
        .record(duration_secs);
}

// =============================================================================
// Cache
// =============================================================================

pub fn record_cache_hit(cache: &str, method: &str) {
    counter!(names::CACHE_HITS_TOTAL, "cache" => cache.to_string(), "method" => method.to_string())
        .increment(1);
}

pub fn record_cache_miss(cache: &str, method: &str) {
    counter!(names::CACHE_MISSES_TOTAL, "cache" => cache.to_string(), "method" => method.to_string())
        .increment(1);
}

// =============================================================================
// Idempotency
// =============================================================================

pub fn record_idempotency_served(method: &str) {
    counter!(names::IDEMPOTENCY_SERVED_TOTAL, "method" => method.to_string()).increment(1);
}

pub fn record_idempotency_executed(method: &str) {
    counter!(names::IDEMPOTENCY_EXECUTED_TOTAL, "method" => method.to_string()).increment(1);
}

pub fn record_idempotency_inflight_conflict(method: &str) {
    counter!(names::IDEMPOTENCY_INFLIGHT_CONFLICT_TOTAL, "method" => method.to_string())
        .increment(1);
}

// =============================================================================
// Durations
// =============================================================================

pub fn record_call_duration(method: &str, status: &str, duration_secs: f64) {
    histogram!(names::CALL_DURATION_SECONDS, "method" => method.to_string(), "status" => status.to_string())
        .record(duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests verify the recorders don't panic without an installed
    // exporter; full metrics testing needs a Prometheus scraper.

    #[test]
    fn test_recorders_without_exporter() {
        record_rate_limit_allowed("Demo#ping", "ip");
        record_rate_limit_rejected("Demo#ping", "ip");
        record_retry_call("Demo#retry");
        record_retry_attempt("Demo#retry");
        record_retry_exhausted("Demo#retry");
        record_cache_hit("demo:ttl=60", "Demo#view");
        record_cache_miss("demo:ttl=60", "Demo#view");
        record_idempotency_served("Demo#pay");
        record_idempotency_executed("Demo#pay");
        record_idempotency_inflight_conflict("Demo#pay");
        record_call_duration("Demo#pay", "OK", 0.01);
        record_retry_duration("Demo#retry", 0.5);
    }
}
