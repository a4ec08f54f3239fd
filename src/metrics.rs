//! Lightweight metrics helpers for the gateway.
//!
//! This module exposes convenience functions and RAII timers wrapping the
//! `metrics` crate macros. No exporter is embedded; the application may
//! install any compatible recorder. Without one every call is a no-op.
//!
//! Provided metrics (labels vary by family):
//! * `gateway_requests_total` (counter: route, status, outcome)
//! * `gateway_request_duration_seconds` (histogram: route)
//! * `gateway_upstream_requests_total` (counter: service, instance, status)
//! * `gateway_upstream_request_duration_seconds` (histogram: service)
//! * `gateway_fallbacks_total` (counter: route, reason)
//! * `gateway_circuit_breaker_state` (gauge: route; 0 closed, 1 half-open, 2 open)
//! * `gateway_pool_instances` (gauge: service)
//! * `gateway_registry_refresh_failures_total` (counter: service)
//! * `gateway_inflight_requests` (gauge: service, instance)
use std::time::{Duration, Instant};

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

pub const GATEWAY_REQUESTS_TOTAL: &str = "gateway_requests_total";
pub const GATEWAY_REQUEST_DURATION_SECONDS: &str = "gateway_request_duration_seconds";
pub const GATEWAY_UPSTREAM_REQUESTS_TOTAL: &str = "gateway_upstream_requests_total";
pub const GATEWAY_UPSTREAM_REQUEST_DURATION_SECONDS: &str =
    "gateway_upstream_request_duration_seconds";
pub const GATEWAY_FALLBACKS_TOTAL: &str = "gateway_fallbacks_total";
pub const GATEWAY_CIRCUIT_BREAKER_STATE: &str = "gateway_circuit_breaker_state";
pub const GATEWAY_POOL_INSTANCES: &str = "gateway_pool_instances";
pub const GATEWAY_REGISTRY_REFRESH_FAILURES_TOTAL: &str = "gateway_registry_refresh_failures_total";
pub const GATEWAY_INFLIGHT_REQUESTS: &str = "gateway_inflight_requests";

static DESCRIPTIONS: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        GATEWAY_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of inbound requests, by route, status and outcome."
    );
    describe_histogram!(
        GATEWAY_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "End-to-end latency of inbound requests."
    );
    describe_counter!(
        GATEWAY_UPSTREAM_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of requests forwarded to upstream instances."
    );
    describe_histogram!(
        GATEWAY_UPSTREAM_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of requests forwarded to upstream instances."
    );
    describe_counter!(
        GATEWAY_FALLBACKS_TOTAL,
        Unit::Count,
        "Fallback responses served, by route and reason."
    );
    describe_gauge!(
        GATEWAY_CIRCUIT_BREAKER_STATE,
        "Circuit breaker state per route (0 closed, 1 half-open, 2 open)."
    );
    describe_gauge!(
        GATEWAY_POOL_INSTANCES,
        Unit::Count,
        "Healthy instances in the current pool snapshot."
    );
    describe_counter!(
        GATEWAY_REGISTRY_REFRESH_FAILURES_TOTAL,
        Unit::Count,
        "Failed registry fetches per service."
    );
    describe_gauge!(
        GATEWAY_INFLIGHT_REQUESTS,
        Unit::Count,
        "Outstanding upstream requests per instance."
    );
});

/// Increment the total request counter for an inbound gateway request.
pub fn increment_request_total(route: &str, status: u16, outcome: &str) {
    counter!(
        GATEWAY_REQUESTS_TOTAL,
        "route" => route.to_string(),
        "status" => status.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a completed inbound request's duration.
pub fn record_request_duration(route: &str, duration: Duration) {
    histogram!(GATEWAY_REQUEST_DURATION_SECONDS, "route" => route.to_string())
        .record(duration.as_secs_f64());
}

/// Increment total count of proxied upstream requests.
pub fn increment_upstream_request_total(service: &str, instance: &str, status: &str) {
    counter!(
        GATEWAY_UPSTREAM_REQUESTS_TOTAL,
        "service" => service.to_string(),
        "instance" => instance.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a completed upstream request duration.
pub fn record_upstream_request_duration(service: &str, duration: Duration) {
    histogram!(
        GATEWAY_UPSTREAM_REQUEST_DURATION_SECONDS,
        "service" => service.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn increment_fallback_total(route: &str, reason: &str) {
    counter!(
        GATEWAY_FALLBACKS_TOTAL,
        "route" => route.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

pub fn set_breaker_state(route: &str, value: f64) {
    gauge!(GATEWAY_CIRCUIT_BREAKER_STATE, "route" => route.to_string()).set(value);
}

pub fn set_pool_instances(service: &str, count: usize) {
    gauge!(GATEWAY_POOL_INSTANCES, "service" => service.to_string()).set(count as f64);
}

pub fn increment_registry_refresh_failures(service: &str) {
    counter!(
        GATEWAY_REGISTRY_REFRESH_FAILURES_TOTAL,
        "service" => service.to_string()
    )
    .increment(1);
}

pub fn set_inflight_requests(service: &str, instance: &str, count: usize) {
    gauge!(
        GATEWAY_INFLIGHT_REQUESTS,
        "service" => service.to_string(),
        "instance" => instance.to_string()
    )
    .set(count as f64);
}

/// RAII helper measuring inbound request duration.
pub struct RequestTimer {
    start: Instant,
    route: String,
}

impl RequestTimer {
    pub fn new(route: &str) -> Self {
        Self {
            start: Instant::now(),
            route: route.to_string(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        record_request_duration(&self.route, self.start.elapsed());
    }
}

/// RAII helper measuring upstream request duration.
pub struct UpstreamRequestTimer {
    start: Instant,
    service: String,
}

impl UpstreamRequestTimer {
    pub fn new(service: &str) -> Self {
        Self {
            start: Instant::now(),
            service: service.to_string(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for UpstreamRequestTimer {
    fn drop(&mut self) {
        record_upstream_request_duration(&self.service, self.start.elapsed());
    }
}

/// Initialize metric descriptions (idempotent).
pub fn init_metrics() -> eyre::Result<()> {
    tracing::info!("Initializing gateway metrics descriptions");
    Lazy::force(&DESCRIPTIONS);
    Ok(())
}
