//! Orchestrator Metrics Collection
//!
//! Task throughput, queue depth, and outbound request counters.

use std::fmt::Write as FmtWrite;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::scraping::fetcher::FetchStats;

/// Atomic counter for thread-safe incrementing
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Increment the counter by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Atomic gauge for thread-safe value tracking
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement the gauge, saturating at zero
    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Fixed-bucket histogram of durations
#[derive(Debug)]
pub struct Histogram {
    /// Bucket boundaries in milliseconds
    buckets: Vec<u64>,
    /// Count per bucket
    counts: Vec<AtomicU64>,
    /// Values exceeding every boundary
    overflow: AtomicU64,
    /// Sum of all values in milliseconds
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn with_buckets(buckets: Vec<u64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            overflow: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Buckets sized for whole tasks: 1s up to 30min
    pub fn new_task_duration() -> Self {
        Self::with_buckets(vec![
            1_000, 5_000, 15_000, 30_000, 60_000, 120_000, 300_000, 600_000, 1_800_000,
        ])
    }

    pub fn observe(&self, duration: Duration) {
        let millis = duration.as_millis() as u64;
        self.sum.fetch_add(millis, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        for (i, &boundary) in self.buckets.iter().enumerate() {
            if millis <= boundary {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        self.overflow.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn mean_ms(&self) -> f64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.sum.load(Ordering::Relaxed) as f64 / count as f64
    }

    pub fn bucket_boundaries(&self) -> &[u64] {
        &self.buckets
    }

    /// Non-cumulative bucket counts
    pub fn bucket_counts(&self) -> Vec<u64> {
        self.counts.iter().map(|c| c.load(Ordering::Relaxed)).collect()
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }

    pub fn sum_ms(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new_task_duration()
    }
}

/// All orchestrator metrics
#[derive(Debug, Default)]
pub struct OrchestratorMetrics {
    // Task metrics
    pub tasks_submitted: Counter,
    pub tasks_completed: Counter,
    pub tasks_failed: Counter,
    pub tasks_cancelled: Counter,
    pub active_tasks: Gauge,
    pub queued_tasks: Gauge,
    pub task_duration: Histogram,

    // Item metrics
    pub items_completed: Counter,
    pub items_failed: Counter,
    pub pages_downloaded: Counter,

    // HTTP metrics
    pub http_requests_total: Counter,
}

impl OrchestratorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shareable metrics instance
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Take a snapshot, folding in outbound request stats when available.
    pub fn snapshot(&self, fetch: Option<&FetchStats>) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_submitted: self.tasks_submitted.get(),
            tasks_completed: self.tasks_completed.get(),
            tasks_failed: self.tasks_failed.get(),
            tasks_cancelled: self.tasks_cancelled.get(),
            active_tasks: self.active_tasks.get(),
            queued_tasks: self.queued_tasks.get(),
            task_duration_ms: self.task_duration.mean_ms(),

            items_completed: self.items_completed.get(),
            items_failed: self.items_failed.get(),
            pages_downloaded: self.pages_downloaded.get(),

            outbound_requests: fetch.map(|f| f.requests()).unwrap_or(0),
            outbound_retries: fetch.map(|f| f.retries()).unwrap_or(0),
            outbound_failures: fetch.map(|f| f.failures()).unwrap_or(0),
            proxied_clients: fetch.map(|f| f.proxied_clients()).unwrap_or(0),
            direct_clients: fetch.map(|f| f.direct_clients()).unwrap_or(0),

            http_requests_total: self.http_requests_total.get(),
        }
    }

    /// Export all metrics in Prometheus exposition format
    pub fn to_prometheus(&self, fetch: Option<&FetchStats>) -> String {
        let mut out = String::with_capacity(4096);
        let s = self.snapshot(fetch);

        // Task metrics
        write_counter(&mut out, "manga_parser_tasks_submitted_total", "Total number of tasks submitted", s.tasks_submitted);
        write_counter(&mut out, "manga_parser_tasks_completed_total", "Total number of tasks completed", s.tasks_completed);
        write_counter(&mut out, "manga_parser_tasks_failed_total", "Total number of tasks failed", s.tasks_failed);
        write_counter(&mut out, "manga_parser_tasks_cancelled_total", "Total number of tasks cancelled", s.tasks_cancelled);
        write_gauge(&mut out, "manga_parser_active_tasks", "Tasks currently executing", s.active_tasks);
        write_gauge(&mut out, "manga_parser_queued_tasks", "Tasks waiting for a worker", s.queued_tasks);
        write_histogram(&mut out, "manga_parser_task_duration_seconds", "Task duration in seconds", &self.task_duration);

        // Item metrics
        write_counter(&mut out, "manga_parser_items_completed_total", "Slugs or chapters processed successfully", s.items_completed);
        write_counter(&mut out, "manga_parser_items_failed_total", "Slugs or chapters that failed", s.items_failed);
        write_counter(&mut out, "manga_parser_pages_downloaded_total", "Page images downloaded", s.pages_downloaded);

        // Outbound metrics
        write_counter(&mut out, "manga_parser_outbound_requests_total", "Requests sent to source sites", s.outbound_requests);
        write_counter(&mut out, "manga_parser_outbound_retries_total", "Retried requests to source sites", s.outbound_retries);
        write_counter(&mut out, "manga_parser_outbound_failures_total", "Requests that failed after retries", s.outbound_failures);
        write_counter(&mut out, "manga_parser_proxied_clients_total", "HTTP clients built through a proxy", s.proxied_clients);
        write_counter(&mut out, "manga_parser_direct_clients_total", "HTTP clients built without a proxy", s.direct_clients);

        // HTTP metrics
        write_counter(&mut out, "manga_parser_http_requests_total", "Total HTTP API requests", s.http_requests_total);

        out
    }
}

fn write_counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} counter", name);
    let _ = writeln!(out, "{} {}", name, value);
    let _ = writeln!(out);
}

fn write_gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} gauge", name);
    let _ = writeln!(out, "{} {}", name, value);
    let _ = writeln!(out);
}

fn write_histogram(out: &mut String, name: &str, help: &str, hist: &Histogram) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} histogram", name);

    let boundaries = hist.bucket_boundaries();
    let counts = hist.bucket_counts();

    // Cumulative: each le bucket includes all lower buckets
    let mut cumulative: u64 = 0;
    for (i, &boundary) in boundaries.iter().enumerate() {
        cumulative += counts[i];
        let le_seconds = boundary as f64 / 1_000.0;
        let _ = writeln!(out, "{}_bucket{{le=\"{}\"}} {}", name, le_seconds, cumulative);
    }
    let total_count = hist.count();
    let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", name, total_count);

    let sum_seconds = hist.sum_ms() as f64 / 1_000.0;
    let _ = writeln!(out, "{}_sum {:.3}", name, sum_seconds);
    let _ = writeln!(out, "{}_count {}", name, total_count);
    let _ = writeln!(out);
}

/// Point-in-time snapshot of all metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    pub active_tasks: u64,
    pub queued_tasks: u64,
    pub task_duration_ms: f64,

    pub items_completed: u64,
    pub items_failed: u64,
    pub pages_downloaded: u64,

    pub outbound_requests: u64,
    pub outbound_retries: u64,
    pub outbound_failures: u64,
    pub proxied_clients: u64,
    pub direct_clients: u64,

    pub http_requests_total: u64,
}

/// Helper for timing operations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Record to histogram and return elapsed
    pub fn record(self, histogram: &Histogram) -> Duration {
        let elapsed = self.elapsed();
        histogram.observe(elapsed);
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new();
        assert_eq!(counter.get(), 0);

        counter.inc();
        assert_eq!(counter.get(), 1);

        counter.add(5);
        assert_eq!(counter.get(), 6);
    }

    #[test]
    fn test_gauge_saturates() {
        let gauge = Gauge::new();
        gauge.set(1);
        gauge.dec();
        gauge.dec();
        assert_eq!(gauge.get(), 0);
        gauge.inc();
        assert_eq!(gauge.get(), 1);
    }

    #[test]
    fn test_histogram_buckets() {
        let histogram = Histogram::new_task_duration();
        histogram.observe(Duration::from_millis(500));
        histogram.observe(Duration::from_secs(20));
        histogram.observe(Duration::from_secs(3600));

        assert_eq!(histogram.count(), 3);
        assert_eq!(histogram.overflow_count(), 1);
        let counts = histogram.bucket_counts();
        assert_eq!(counts[0], 1);
        assert_eq!(counts[3], 1);
    }

    #[test]
    fn test_timer() {
        let histogram = Histogram::new_task_duration();
        let timer = Timer::start();
        std::thread::sleep(Duration::from_millis(5));
        let elapsed = timer.record(&histogram);
        assert!(elapsed.as_millis() >= 5);
        assert_eq!(histogram.count(), 1);
    }

    #[test]
    fn test_snapshot_without_fetch_stats() {
        let metrics = OrchestratorMetrics::new();
        metrics.tasks_submitted.add(3);
        metrics.pages_downloaded.add(40);

        let snapshot = metrics.snapshot(None);
        assert_eq!(snapshot.tasks_submitted, 3);
        assert_eq!(snapshot.pages_downloaded, 40);
        assert_eq!(snapshot.outbound_retries, 0);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = OrchestratorMetrics::new();
        metrics.tasks_completed.add(2);
        metrics.queued_tasks.set(4);
        metrics.task_duration.observe(Duration::from_secs(3));
        metrics.task_duration.observe(Duration::from_secs(40));

        let output = metrics.to_prometheus(Some(&FetchStats::default()));

        assert!(output.contains("# TYPE manga_parser_tasks_completed_total counter"));
        assert!(output.contains("manga_parser_tasks_completed_total 2"));
        assert!(output.contains("# TYPE manga_parser_queued_tasks gauge"));
        assert!(output.contains("manga_parser_queued_tasks 4"));
        assert!(output.contains("manga_parser_task_duration_seconds_bucket{le=\"5\"} 1"));
        assert!(output.contains("manga_parser_task_duration_seconds_bucket{le=\"60\"} 2"));
        assert!(output.contains("manga_parser_task_duration_seconds_bucket{le=\"+Inf\"} 2"));
        assert!(output.contains("manga_parser_outbound_retries_total 0"));
    }
}
