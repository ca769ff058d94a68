use crate::error::ServiceError;
use crate::protocol::ScrapeStatus;
use crate::worker::PoolStats;
use metrics::{register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Handles for every metric either server emits.
///
/// Handles are registered against whatever recorder is installed when the
/// struct is built; without one they are no-ops.
pub struct Metrics {
    pub jobs_started: Counter,
    pub jobs_ok: Counter,
    pub jobs_partial: Counter,
    pub jobs_failed: Counter,
    pub job_duration: Histogram,
    pub fetch_failures: Counter,
    pub rate_limited: Counter,
    pub cache_hits: Counter,
    pub analyses_ok: Counter,
    pub analyses_failed: Counter,
    pub analysis_duration: Histogram,
    pub pool_active: Gauge,
    pub pool_queued: Gauge,
    pub overload_rejections: Counter,
    pub upstream_reconnects: Counter,
    pub unknown_job_ids: Counter,
    pub frame_errors: Counter,
    pub open_connections: Gauge,
    pub memory_usage: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            jobs_started: register_counter!("page_analyzer_jobs_started_total"),
            jobs_ok: register_counter!("page_analyzer_jobs_total", "status" => "ok"),
            jobs_partial: register_counter!("page_analyzer_jobs_total", "status" => "partial"),
            jobs_failed: register_counter!("page_analyzer_jobs_total", "status" => "failed"),
            job_duration: register_histogram!("page_analyzer_job_duration_seconds"),
            fetch_failures: register_counter!("page_analyzer_fetch_failures_total"),
            rate_limited: register_counter!("page_analyzer_rate_limited_total"),
            cache_hits: register_counter!("page_analyzer_cache_hits_total"),
            analyses_ok: register_counter!("page_analyzer_analyses_total", "outcome" => "ok"),
            analyses_failed: register_counter!("page_analyzer_analyses_total", "outcome" => "error"),
            analysis_duration: register_histogram!("page_analyzer_analysis_duration_seconds"),
            pool_active: register_gauge!("page_analyzer_pool_active_workers"),
            pool_queued: register_gauge!("page_analyzer_pool_queued_requests"),
            overload_rejections: register_counter!("page_analyzer_overload_rejections_total"),
            upstream_reconnects: register_counter!("page_analyzer_upstream_connects_total"),
            unknown_job_ids: register_counter!("page_analyzer_unknown_job_ids_total"),
            frame_errors: register_counter!("page_analyzer_frame_errors_total"),
            open_connections: register_gauge!("page_analyzer_open_connections"),
            memory_usage: register_gauge!("page_analyzer_memory_usage_bytes"),
        }
    }

    pub fn record_job_started(&self) {
        self.jobs_started.increment(1);
    }

    pub fn record_job(&self, status: ScrapeStatus, duration: Duration) {
        match status {
            ScrapeStatus::Ok => self.jobs_ok.increment(1),
            ScrapeStatus::Partial => self.jobs_partial.increment(1),
            ScrapeStatus::Failed => self.jobs_failed.increment(1),
        }
        self.job_duration.record(duration.as_secs_f64());
    }

    pub fn record_analysis(&self, success: bool, duration: Duration) {
        if success {
            self.analyses_ok.increment(1);
        } else {
            self.analyses_failed.increment(1);
        }
        self.analysis_duration.record(duration.as_secs_f64());
    }

    pub fn record_pool(&self, stats: &PoolStats) {
        self.pool_active.set(stats.active as f64);
        self.pool_queued.set(stats.queued as f64);
    }

    pub fn connection_opened(&self) {
        self.open_connections.increment(1.0);
    }

    pub fn connection_closed(&self) {
        self.open_connections.decrement(1.0);
    }

    pub fn record_memory_usage(&self, bytes: usize) {
        self.memory_usage.set(bytes as f64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MetricsCollector {
    metrics: Arc<Metrics>,
    start_time: Instant,
    collection_interval: Duration,
}

impl MetricsCollector {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            metrics,
            start_time: Instant::now(),
            collection_interval: Duration::from_secs(10),
        }
    }

    /// Sample process memory periodically until the returned task is aborted.
    pub fn start_collection(&self) -> JoinHandle<()> {
        let metrics = Arc::clone(&self.metrics);
        let interval = self.collection_interval;

        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(interval);
            loop {
                interval_timer.tick().await;
                if let Some(memory) = Self::get_memory_usage() {
                    metrics.record_memory_usage(memory);
                    debug!("Resident memory {} bytes", memory);
                }
            }
        })
    }

    /// Resident set size from /proc/self/status. `None` where unavailable.
    pub fn get_memory_usage() -> Option<usize> {
        let content = std::fs::read_to_string("/proc/self/status").ok()?;
        parse_vm_rss(&content)
    }

    pub fn get_uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}

fn parse_vm_rss(status: &str) -> Option<usize> {
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<usize>().ok())
        .map(|kb| kb * 1024)
}

pub struct PrometheusExporter {
    port: u16,
}

impl PrometheusExporter {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    /// Install the global recorder and serve `/metrics` on the configured port.
    /// Must run inside the tokio runtime.
    pub fn start(&self) -> Result<(), ServiceError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| ServiceError::Configuration(format!("metrics exporter: {e}")))?;

        info!("Serving Prometheus metrics on {}", addr);
        Ok(())
    }
}
