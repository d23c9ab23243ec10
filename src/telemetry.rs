//! Tracing initialization and Prometheus metrics.
//!
//! Metric names follow `bridge_<subsystem>_<metric>_<unit>`.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Gauge, GaugeVec, Histogram, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use tracing_subscriber::EnvFilter;

lazy_static! {
    /// Global metrics registry.
    pub static ref REGISTRY: Registry = Registry::new();

    /// Messages routed, by envelope type.
    pub static ref MESSAGES_ROUTED: IntCounterVec = IntCounterVec::new(
        Opts::new("bridge_router_messages_total", "Messages routed, by type"),
        &["type"]
    ).expect("metric creation failed");

    /// Errors emitted by the router, by code.
    pub static ref ROUTER_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("bridge_router_errors_total", "Error replies emitted, by code"),
        &["code"]
    ).expect("metric creation failed");

    /// Commands suppressed or replayed by the idempotency cache.
    pub static ref IDEMPOTENT_HITS: IntCounter = IntCounter::new(
        "bridge_router_idempotent_hits_total",
        "Commands collapsed by the idempotency cache"
    ).expect("metric creation failed");

    /// Current state entry count.
    pub static ref STATE_ENTRIES: Gauge = Gauge::new(
        "bridge_state_entries",
        "Entries currently in the state store"
    ).expect("metric creation failed");

    /// Live subscriptions.
    pub static ref SUBSCRIPTIONS: Gauge = Gauge::new(
        "bridge_subscriptions",
        "Live subscriptions"
    ).expect("metric creation failed");

    /// Connected application clients.
    pub static ref CLIENTS_CONNECTED: Gauge = Gauge::new(
        "bridge_clients_connected",
        "Application clients currently connected"
    ).expect("metric creation failed");

    /// Upstream connection state, by state label (1 = current).
    pub static ref UPSTREAM_STATE: GaugeVec = GaugeVec::new(
        Opts::new("bridge_upstream_connection_state", "Upstream connection state"),
        &["state"]
    ).expect("metric creation failed");

    /// Upstream reconnect attempts.
    pub static ref UPSTREAM_RECONNECTS: IntCounter = IntCounter::new(
        "bridge_upstream_reconnects_total",
        "Upstream reconnection attempts"
    ).expect("metric creation failed");

    /// Heartbeat round-trip latency in seconds.
    pub static ref UPSTREAM_LATENCY: Histogram = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "bridge_upstream_heartbeat_latency_seconds",
            "PING/PONG round-trip latency"
        ).buckets(prometheus::exponential_buckets(0.001, 2.0, 12).expect("valid buckets"))
    ).expect("metric creation failed");

    /// Frames dropped by the per-client rate limiter.
    pub static ref RATE_LIMITED: IntCounter = IntCounter::new(
        "bridge_clients_rate_limited_total",
        "Client frames rejected by the rate limiter"
    ).expect("metric creation failed");
}

/// Registers every metric with the global registry. Idempotent per
/// process; repeated registration errors are ignored.
pub fn register_metrics() {
    let _ = REGISTRY.register(Box::new(MESSAGES_ROUTED.clone()));
    let _ = REGISTRY.register(Box::new(ROUTER_ERRORS.clone()));
    let _ = REGISTRY.register(Box::new(IDEMPOTENT_HITS.clone()));
    let _ = REGISTRY.register(Box::new(STATE_ENTRIES.clone()));
    let _ = REGISTRY.register(Box::new(SUBSCRIPTIONS.clone()));
    let _ = REGISTRY.register(Box::new(CLIENTS_CONNECTED.clone()));
    let _ = REGISTRY.register(Box::new(UPSTREAM_STATE.clone()));
    let _ = REGISTRY.register(Box::new(UPSTREAM_RECONNECTS.clone()));
    let _ = REGISTRY.register(Box::new(UPSTREAM_LATENCY.clone()));
    let _ = REGISTRY.register(Box::new(RATE_LIMITED.clone()));
}

/// Sets the single-state gauge family so exactly one label is 1.
pub fn set_upstream_state(current: &str) {
    for state in [
        "disconnected",
        "connecting",
        "connected",
        "reconnecting",
        "error",
    ] {
        UPSTREAM_STATE
            .with_label_values(&[state])
            .set(if state == current { 1.0 } else { 0.0 });
    }
}

/// Renders the registry in Prometheus text exposition format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Initializes the tracing subscriber from the configured directive,
/// overridable via `RUST_LOG`.
pub fn init_tracing(directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_state_is_one_hot() {
        register_metrics();
        set_upstream_state("connected");

        assert_eq!(
            UPSTREAM_STATE.with_label_values(&["connected"]).get(),
            1.0
        );
        assert_eq!(
            UPSTREAM_STATE.with_label_values(&["disconnected"]).get(),
            0.0
        );
    }

    #[test]
    fn gather_renders_registered_metrics() {
        register_metrics();
        MESSAGES_ROUTED.with_label_values(&["state"]).inc();

        let text = gather();
        assert!(text.contains("bridge_router_messages_total"));
    }
}
