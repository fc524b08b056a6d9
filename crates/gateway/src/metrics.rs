//! Request metrics and the Prometheus text exposition.
//!
//! Counters and the latency histogram are updated by the request-tracking
//! middleware. Engine gauges are sampled when `/metrics` is scraped.

use std::time::Duration;

use engine::EngineStats;
use parking_lot::Mutex;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Content type of the text exposition format.
pub const CONTENT_TYPE: &str = prometheus::TEXT_FORMAT;

/// Process-wide request metrics, backed by a private registry.
pub struct Metrics {
    registry: Registry,
    requests: IntCounterVec,
    latency: Histogram,
    database_size: IntGauge,
    memory_usage: IntGauge,
    key_count: IntGauge,
    segments: IntGauge,
    flushes: IntCounter,
    compactions: IntCounter,
    background_errors: IntCounter,
    /// Serializes scrapes so engine counters are advanced once per change.
    scrape: Mutex<()>,
}

impl Metrics {
    /// Creates and registers every metric.
    ///
    /// # Errors
    ///
    /// Fails only if two metrics share a name.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let requests = IntCounterVec::new(
            Opts::new("shoalkv_requests_total", "Total requests"),
            &["method", "endpoint"],
        )?;
        let latency = Histogram::with_opts(HistogramOpts::new(
            "shoalkv_request_duration_seconds",
            "Request latency",
        ))?;
        let database_size = IntGauge::new(
            "shoalkv_database_size_bytes",
            "Sum of key and value bytes over live keys",
        )?;
        let memory_usage =
            IntGauge::new("shoalkv_memory_usage_bytes", "Resident set size of the process")?;
        let key_count = IntGauge::new("shoalkv_key_count", "Number of live keys")?;
        let segments = IntGauge::new("shoalkv_segments", "Number of live segment files")?;
        let flushes = IntCounter::new("shoalkv_flushes_total", "Memtables written to segments")?;
        let compactions = IntCounter::new("shoalkv_compactions_total", "Completed compactions")?;
        let background_errors = IntCounter::new(
            "shoalkv_background_errors_total",
            "Failed background flushes and compactions",
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(latency.clone()))?;
        for gauge in [&database_size, &memory_usage, &key_count, &segments] {
            registry.register(Box::new(gauge.clone()))?;
        }
        for counter in [&flushes, &compactions, &background_errors] {
            registry.register(Box::new(counter.clone()))?;
        }

        Ok(Self {
            registry,
            requests,
            latency,
            database_size,
            memory_usage,
            key_count,
            segments,
            flushes,
            compactions,
            background_errors,
            scrape: Mutex::new(()),
        })
    }

    /// Counts one handled request and records its latency.
    pub fn record(&self, method: &str, endpoint: &str, elapsed: Duration) {
        self.requests.with_label_values(&[method, endpoint]).inc();
        self.latency.observe(elapsed.as_secs_f64());
    }

    /// Renders every metric. `stats` is `None` while the engine is starting;
    /// the engine gauges then read zero.
    ///
    /// # Errors
    ///
    /// Propagates encoder failures.
    pub fn render(&self, stats: Option<&EngineStats>) -> prometheus::Result<String> {
        let _scrape = self.scrape.lock();

        self.database_size.set(gauge_value(stats.map_or(0, |s| s.live_bytes)));
        self.key_count.set(gauge_value(stats.map_or(0, |s| s.key_count)));
        self.segments.set(gauge_value(stats.map_or(0, |s| s.segment_count as u64)));
        self.memory_usage.set(gauge_value(resident_memory_bytes().unwrap_or(0)));
        if let Some(stats) = stats {
            advance(&self.flushes, stats.flushes);
            advance(&self.compactions, stats.compactions);
            advance(&self.background_errors, stats.background_errors);
        }

        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Moves a counter mirroring an engine total up to `total`.
fn advance(counter: &IntCounter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}

fn gauge_value(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

/// Resident set size of this process. `None` where the platform does not
/// report it.
pub fn resident_memory_bytes() -> Option<u64> {
    memory_stats::memory_stats().map(|usage| usage.physical_mem as u64)
}
