// src/core/metrics.rs

//! Defines and registers Prometheus metrics for the control plane.
//!
//! Uses `once_cell::sync::Lazy` so every metric is registered exactly once
//! globally for the process lifetime, the same one-shot-registration
//! guarantee the teacher gets from `lazy_static!`.

use once_cell::sync::Lazy;
use prometheus::{
    Counter, CounterVec, Gauge, GaugeVec, Histogram, HistogramVec, TextEncoder,
    register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_histogram, register_histogram_vec,
};

// --- Node-wide gauges ---

/// `1` once this node has joined or initialized a cluster, `0` otherwise.
pub static CLUSTER_ENABLED: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("maxiofs_cluster_enabled", "Whether the cluster control plane is enabled on this node.").unwrap()
});

/// Count of entries in the node registry, excluding removed nodes.
pub static REGISTERED_NODES: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("maxiofs_cluster_registered_nodes", "Number of nodes currently in the registry.").unwrap()
});

/// `health_status` as a number per peer, for at-a-glance dashboards.
pub static PEER_HEALTH_STATUS: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "maxiofs_cluster_peer_health_status",
        "Health status of a peer (0=unknown,1=healthy,2=degraded,3=unavailable,4=removed).",
        &["peer_id", "peer_name"]
    )
    .unwrap()
});

// --- Sync counters ---

/// Total entity records pushed, labeled by entity type and outcome.
pub static SYNC_PUSHES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "maxiofs_cluster_sync_pushes_total",
        "Total entity sync pushes attempted, labeled by entity type and outcome.",
        &["entity_type", "outcome"]
    )
    .unwrap()
});

/// Total tombstones pushed to peers, labeled by entity type.
pub static TOMBSTONE_PUSHES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "maxiofs_cluster_tombstone_pushes_total",
        "Total tombstone sync pushes, labeled by entity type.",
        &["entity_type"]
    )
    .unwrap()
});

/// Total reconciliations run, labeled by mode (offline/partition).
pub static RECONCILE_RUNS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "maxiofs_cluster_reconcile_runs_total",
        "Total stale-reconciliation passes run, labeled by mode.",
        &["mode"]
    )
    .unwrap()
});

// --- Health checker ---

/// Latency of a successful health probe, labeled by peer.
pub static HEALTH_PROBE_LATENCY_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "maxiofs_cluster_health_probe_latency_seconds",
        "Latency of health probes against peers, labeled by peer id.",
        &["peer_id"]
    )
    .unwrap()
});

pub static HEALTH_PROBES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "maxiofs_cluster_health_probes_total",
        "Total health probes attempted, labeled by outcome.",
        &["outcome"]
    )
    .unwrap()
});

// --- Circuit breaker ---

/// Breaker state per peer (0=closed,1=open,2=half-open).
pub static BREAKER_STATE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "maxiofs_cluster_breaker_state",
        "Circuit breaker state per peer (0=closed,1=open,2=half-open).",
        &["peer_id"]
    )
    .unwrap()
});

pub static BREAKER_TRIPS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!("maxiofs_cluster_breaker_trips_total", "Total times a circuit breaker opened.").unwrap()
});

// --- Bucket router / aggregator ---

pub static BUCKET_ROUTE_CACHE_HITS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "maxiofs_cluster_bucket_route_cache_hits_total",
        "Total bucket-location cache hits."
    )
    .unwrap()
});

pub static BUCKET_ROUTE_CACHE_MISSES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "maxiofs_cluster_bucket_route_cache_misses_total",
        "Total bucket-location cache misses."
    )
    .unwrap()
});

pub static BUCKET_AGGREGATE_LATENCY_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "maxiofs_cluster_bucket_aggregate_latency_seconds",
        "Latency of ListAllBuckets fan-out across healthy peers."
    )
    .unwrap()
});

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap()
}
