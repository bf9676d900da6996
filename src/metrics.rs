use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, register_counter, register_counter_vec, register_gauge,
    register_histogram,
};

lazy_static! {
    pub static ref REQUEST_TOTAL: Counter =
        register_counter!("gatekeeper_requests_total", "Total number of requests seen by the gate")
            .expect("register gatekeeper_requests_total");
    pub static ref ADMITTED_TOTAL: Counter =
        register_counter!("gatekeeper_admitted_total", "Requests admitted past the gate")
            .expect("register gatekeeper_admitted_total");
    pub static ref AUTH_REJECTIONS: CounterVec = register_counter_vec!(
        "gatekeeper_auth_rejections_total",
        "Requests rejected by authentication, by reason",
        &["reason"]
    )
    .expect("register gatekeeper_auth_rejections_total");
    pub static ref RATE_LIMITED_TOTAL: Counter =
        register_counter!("gatekeeper_rate_limited_total", "Requests rejected by the rate limiter")
            .expect("register gatekeeper_rate_limited_total");
    pub static ref TRACKED_CLIENTS: Gauge = register_gauge!(
        "gatekeeper_tracked_clients",
        "Clients with a live rate record after the last sweep"
    )
    .expect("register gatekeeper_tracked_clients");
    pub static ref SWEEP_EVICTIONS: Counter = register_counter!(
        "gatekeeper_sweep_evictions_total",
        "Idle client records removed by the sweep"
    )
    .expect("register gatekeeper_sweep_evictions_total");
    pub static ref UPSTREAM_LATENCY: Histogram = register_histogram!(
        "gatekeeper_upstream_latency_seconds",
        "Upstream request latency in seconds"
    )
    .expect("register gatekeeper_upstream_latency_seconds");
}
