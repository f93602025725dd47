//! Metrics registry + the four-route HTTP surface (§6). Owned by
//! `BridgeContext`, never a process global (§9 design note).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use atlas_transport::transport::MetricsSink;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde_json::json;

const HISTOGRAM_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0];

#[derive(Debug, Default)]
struct Histogram {
    bucket_counts: Vec<u64>,
    count: u64,
    sum: f64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            bucket_counts: vec![0; HISTOGRAM_BUCKETS.len()],
            count: 0,
            sum: 0.0,
        }
    }

    fn observe(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        for (i, bound) in HISTOGRAM_BUCKETS.iter().enumerate() {
            if value <= *bound {
                self.bucket_counts[i] += 1;
                break;
            }
        }
    }

    /// Cumulative `le` bucket counts, e.g. Prometheus's `_bucket{le=...}` series.
    fn cumulative_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        HISTOGRAM_BUCKETS
            .iter()
            .zip(self.bucket_counts.iter())
            .map(|(bound, count)| {
                cumulative += count;
                (*bound, cumulative)
            })
            .collect()
    }
}

pub struct MetricsRegistry {
    counters: RwLock<HashMap<&'static str, u64>>,
    gauges: RwLock<HashMap<&'static str, f64>>,
    histograms: RwLock<HashMap<&'static str, Histogram>>,
    ready: AtomicBool,
    started_at: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            histograms: RwLock::new(HashMap::new()),
            ready: AtomicBool::new(false),
            started_at: Instant::now(),
        })
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn observe_histogram(&self, name: &'static str, value: f64) {
        self.histograms.write().unwrap().entry(name).or_insert_with(Histogram::new).observe(value);
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.read().unwrap().get(name).copied().unwrap_or(0)
    }
}

impl MetricsSink for MetricsRegistry {
    fn incr_counter(&self, name: &'static str) {
        *self.counters.write().unwrap().entry(name).or_insert(0) += 1;
    }

    fn set_gauge(&self, name: &'static str, value: f64) {
        self.gauges.write().unwrap().insert(name, value);
    }
}

pub fn router(registry: Arc<MetricsRegistry>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/status", get(status))
        .route("/metrics", get(metrics_text))
        .with_state(registry)
}

async fn health() -> &'static str {
    "ok"
}

async fn ready(State(registry): State<Arc<MetricsRegistry>>) -> impl IntoResponse {
    if registry.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not-ready")
    }
}

async fn status(State(registry): State<Arc<MetricsRegistry>>) -> Json<serde_json::Value> {
    let counters = registry.counters.read().unwrap().clone();
    let gauges = registry.gauges.read().unwrap().clone();
    let histograms: HashMap<&'static str, serde_json::Value> = registry
        .histograms
        .read()
        .unwrap()
        .iter()
        .map(|(name, hist)| {
            let buckets: Vec<serde_json::Value> = hist
                .cumulative_buckets()
                .into_iter()
                .map(|(bound, count)| json!({"le": bound, "count": count}))
                .collect();
            (*name, json!({"buckets": buckets, "count": hist.count, "sum": hist.sum}))
        })
        .collect();
    Json(json!({
        "uptime_seconds": registry.uptime_seconds(),
        "counters": counters,
        "gauges": gauges,
        "histograms": histograms,
    }))
}

async fn metrics_text(State(registry): State<Arc<MetricsRegistry>>) -> String {
    let mut out = String::new();
    for (name, value) in registry.counters.read().unwrap().iter() {
        out.push_str(&format!("# HELP {name} Monotonic counter.\n# TYPE {name} counter\n{name} {value}\n"));
    }
    for (name, value) in registry.gauges.read().unwrap().iter() {
        out.push_str(&format!("# HELP {name} Current value.\n# TYPE {name} gauge\n{name} {value}\n"));
    }
    for (name, hist) in registry.histograms.read().unwrap().iter() {
        out.push_str(&format!("# HELP {name} Observed durations.\n# TYPE {name} histogram\n"));
        for (bound, cumulative) in hist.cumulative_buckets() {
            out.push_str(&format!("{name}_bucket{{le=\"{bound}\"}} {cumulative}\n"));
        }
        out.push_str(&format!("{name}_bucket{{le=\"+Inf\"}} {}\n", hist.count));
        out.push_str(&format!("{name}_sum {}\n", hist.sum));
        out.push_str(&format!("{name}_count {}\n", hist.count));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_and_gauges_are_independent() {
        let registry = MetricsRegistry::new();
        registry.incr_counter("ignored_total");
        registry.incr_counter("ignored_total");
        registry.set_gauge("spool_depth", 3.0);
        assert_eq!(*registry.counters.read().unwrap().get("ignored_total").unwrap(), 2);
        assert_eq!(*registry.gauges.read().unwrap().get("spool_depth").unwrap(), 3.0);
    }

    #[test]
    fn histogram_buckets_count_each_observation_once() {
        let registry = MetricsRegistry::new();
        registry.observe_histogram("handler_duration_seconds", 0.02);
        registry.observe_histogram("handler_duration_seconds", 2.0);
        let histograms = registry.histograms.read().unwrap();
        let hist = histograms.get("handler_duration_seconds").unwrap();
        assert_eq!(hist.count, 2);
        // 0.02 falls into the 0.05 bucket, 2.0 into the 5.0 bucket; each
        // observation lands in exactly one bucket, never more than one.
        assert_eq!(hist.bucket_counts, vec![0, 1, 0, 0, 0, 1, 0]);
        assert_eq!(hist.bucket_counts.iter().sum::<u64>(), hist.count);
    }

    #[test]
    fn cumulative_buckets_accumulate_across_bounds() {
        let registry = MetricsRegistry::new();
        registry.observe_histogram("handler_duration_seconds", 0.02);
        registry.observe_histogram("handler_duration_seconds", 2.0);
        let histograms = registry.histograms.read().unwrap();
        let hist = histograms.get("handler_duration_seconds").unwrap();
        let cumulative: Vec<u64> = hist.cumulative_buckets().into_iter().map(|(_, c)| c).collect();
        assert_eq!(cumulative, vec![0, 1, 1, 1, 1, 2, 2]);
    }

    #[test]
    fn not_ready_until_marked() {
        let registry = MetricsRegistry::new();
        assert!(!registry.is_ready());
        registry.mark_ready();
        assert!(registry.is_ready());
    }
}
