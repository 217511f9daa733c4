//! Prometheus metrics for the proxy
//!
//! All collectors live in a private [`Registry`] so several proxies (and the
//! test suite) can coexist in one process.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Outcome of a stat issued by the serving layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatResult {
    Found,
    NotRegistered,
    ResolveFailed,
    NotAFile,
}

impl StatResult {
    fn as_label(&self) -> &'static str {
        match self {
            StatResult::Found => "found",
            StatResult::NotRegistered => "not_registered",
            StatResult::ResolveFailed => "resolve_failed",
            StatResult::NotAFile => "not_a_file",
        }
    }
}

/// Metrics collected by the proxy
#[derive(Clone)]
pub struct ProxyMetrics {
    registry: Registry,

    /// Requests served, by response status
    requests_total: IntCounterVec,

    /// Time from request receipt to response headers
    request_duration_seconds: Histogram,

    /// Identifiers currently registered
    registry_entries: IntGauge,

    /// Stat outcomes
    stat_results_total: IntCounterVec,

    /// Chunk cache lookups by result (hit/miss)
    chunk_cache_total: IntCounterVec,

    /// Bytes received from upstream
    upstream_bytes_total: IntCounter,
}

impl ProxyMetrics {
    /// Create metrics in a fresh private registry
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new())
    }

    /// Create metrics registered in `registry`
    pub fn with_registry(registry: Registry) -> Result<Self, prometheus::Error> {
        let requests_total = IntCounterVec::new(
            Opts::new("vfscache_requests_total", "Total number of requests served"),
            &["status"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "vfscache_request_duration_seconds",
                "Time to produce response headers in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
        )?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        let registry_entries = IntGauge::new(
            "vfscache_registry_entries",
            "Number of registered remote identifiers",
        )?;
        registry.register(Box::new(registry_entries.clone()))?;

        let stat_results_total = IntCounterVec::new(
            Opts::new("vfscache_stat_results_total", "Stat outcomes by result"),
            &["result"],
        )?;
        registry.register(Box::new(stat_results_total.clone()))?;

        let chunk_cache_total = IntCounterVec::new(
            Opts::new("vfscache_chunk_cache_total", "Chunk cache lookups by result"),
            &["result"],
        )?;
        registry.register(Box::new(chunk_cache_total.clone()))?;

        let upstream_bytes_total = IntCounter::new(
            "vfscache_upstream_bytes_total",
            "Total bytes received from upstream",
        )?;
        registry.register(Box::new(upstream_bytes_total.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration_seconds,
            registry_entries,
            stat_results_total,
            chunk_cache_total,
            upstream_bytes_total,
        })
    }

    pub fn record_request(&self, status: u16, duration: Duration) {
        self.requests_total
            .with_label_values(&[status.to_string().as_str()])
            .inc();
        self.request_duration_seconds.observe(duration.as_secs_f64());
    }

    pub fn set_registry_entries(&self, count: usize) {
        self.registry_entries.set(count as i64);
    }

    pub fn record_stat(&self, result: StatResult) {
        self.stat_results_total
            .with_label_values(&[result.as_label()])
            .inc();
    }

    pub fn record_chunk_hit(&self) {
        self.chunk_cache_total.with_label_values(&["hit"]).inc();
    }

    pub fn record_chunk_miss(&self) {
        self.chunk_cache_total.with_label_values(&["miss"]).inc();
    }

    pub fn record_upstream_bytes(&self, bytes: u64) {
        self.upstream_bytes_total.inc_by(bytes);
    }

    /// Render every metric in the Prometheus text exposition format
    pub fn export_text(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
