//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics so the acquisition worker, publisher and control loop can all
//! record without contention. Reporting swaps the per-interval values.
//!
//! NOTE: All atomics use Relaxed ordering intentionally; these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Exponential bucket boundaries for tick processing latency (microseconds)
/// Buckets: ≤500, ≤1000, ≤2000, ... ≤256000, >256000
const BUCKET_BOUNDS: [u64; 10] = [500, 1_000, 2_000, 4_000, 8_000, 16_000, 32_000, 64_000, 128_000, 256_000];
pub const METRICS_NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(current_max, new_value, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; METRICS_NUM_BUCKETS]) -> [u64; METRICS_NUM_BUCKETS] {
    let mut result = [0u64; METRICS_NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; METRICS_NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = ((total as f64 * percentile).ceil() as u64).max(1);
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; METRICS_NUM_BUCKETS] =
        [500, 1_000, 2_000, 4_000, 8_000, 16_000, 32_000, 64_000, 128_000, 256_000, 512_000];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[METRICS_NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Ticks run by the control loop (monotonic)
    ticks_total: AtomicU64,
    /// Frames delivered to the control loop (monotonic)
    frames_total: AtomicU64,
    /// Frames delivered since last report (reset on report)
    frames_since_report: AtomicU64,
    /// get_frame calls that ended without a frame (monotonic)
    acquisition_timeouts: AtomicU64,
    /// Acquisition worker teardown/recreate cycles (monotonic)
    worker_restarts: AtomicU64,
    /// Frames overwritten in the hand-off slot before being read (monotonic)
    frames_superseded: AtomicU64,
    cycles_total: AtomicU64,
    part_1_total: AtomicU64,
    part_2_total: AtomicU64,
    persist_failures: AtomicU64,
    telemetry_published: AtomicU64,
    telemetry_dropped: AtomicU64,
    broker_reconnects: AtomicU64,
    config_reloads: AtomicU64,
    config_rejected: AtomicU64,
    /// Tick processing latency (reset on report)
    latency_sum_us: AtomicU64,
    latency_max_us: AtomicU64,
    latency_count: AtomicU64,
    latency_buckets: [AtomicU64; METRICS_NUM_BUCKETS],
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            ticks_total: AtomicU64::new(0),
            frames_total: AtomicU64::new(0),
            frames_since_report: AtomicU64::new(0),
            acquisition_timeouts: AtomicU64::new(0),
            worker_restarts: AtomicU64::new(0),
            frames_superseded: AtomicU64::new(0),
            cycles_total: AtomicU64::new(0),
            part_1_total: AtomicU64::new(0),
            part_2_total: AtomicU64::new(0),
            persist_failures: AtomicU64::new(0),
            telemetry_published: AtomicU64::new(0),
            telemetry_dropped: AtomicU64::new(0),
            broker_reconnects: AtomicU64::new(0),
            config_reloads: AtomicU64::new(0),
            config_rejected: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            latency_count: AtomicU64::new(0),
            latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_tick(&self) {
        self.ticks_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_frame(&self) {
        self.frames_total.fetch_add(1, Ordering::Relaxed);
        self.frames_since_report.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_acquisition_timeout(&self) {
        self.acquisition_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_worker_restart(&self) {
        self.worker_restarts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_frames_superseded(&self, count: u64) {
        self.frames_superseded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_cycle(&self, part_1: bool, part_2: bool) {
        self.cycles_total.fetch_add(1, Ordering::Relaxed);
        if part_1 {
            self.part_1_total.fetch_add(1, Ordering::Relaxed);
        }
        if part_2 {
            self.part_2_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_persist_failure(&self) {
        self.persist_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_telemetry(&self, published: bool) {
        if published {
            self.telemetry_published.fetch_add(1, Ordering::Relaxed);
        } else {
            self.telemetry_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_broker_reconnect(&self) {
        self.broker_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_config_reload(&self, accepted: bool) {
        if accepted {
            self.config_reloads.fetch_add(1, Ordering::Relaxed);
        } else {
            self.config_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record processing time of one tick (after the frame arrived)
    #[inline]
    pub fn record_tick_latency(&self, latency_us: u64) {
        self.latency_count.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.latency_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.latency_max_us, latency_us);
    }

    pub fn cycles_total(&self) -> u64 {
        self.cycles_total.load(Ordering::Relaxed)
    }

    pub fn worker_restarts(&self) -> u64 {
        self.worker_restarts.load(Ordering::Relaxed)
    }

    pub fn telemetry_dropped(&self) -> u64 {
        self.telemetry_dropped.load(Ordering::Relaxed)
    }

    pub fn telemetry_published(&self) -> u64 {
        self.telemetry_published.load(Ordering::Relaxed)
    }

    pub fn persist_failures(&self) -> u64 {
        self.persist_failures.load(Ordering::Relaxed)
    }

    /// Produce a summary and reset the per-interval values
    pub fn report(&self) -> MetricsSummary {
        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let frames = self.frames_since_report.swap(0, Ordering::Relaxed);
        let count = self.latency_count.swap(0, Ordering::Relaxed);
        let sum = self.latency_sum_us.swap(0, Ordering::Relaxed);
        let max = self.latency_max_us.swap(0, Ordering::Relaxed);
        let buckets = swap_buckets(&self.latency_buckets);
        let secs = elapsed.as_secs_f64();

        MetricsSummary {
            ticks_total: self.ticks_total.load(Ordering::Relaxed),
            frames_total: self.frames_total.load(Ordering::Relaxed),
            frames_per_sec: if secs > 0.0 { frames as f64 / secs } else { 0.0 },
            acquisition_timeouts: self.acquisition_timeouts.load(Ordering::Relaxed),
            worker_restarts: self.worker_restarts.load(Ordering::Relaxed),
            frames_superseded: self.frames_superseded.load(Ordering::Relaxed),
            cycles_total: self.cycles_total.load(Ordering::Relaxed),
            part_1_total: self.part_1_total.load(Ordering::Relaxed),
            part_2_total: self.part_2_total.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            telemetry_published: self.telemetry_published.load(Ordering::Relaxed),
            telemetry_dropped: self.telemetry_dropped.load(Ordering::Relaxed),
            broker_reconnects: self.broker_reconnects.load(Ordering::Relaxed),
            config_reloads: self.config_reloads.load(Ordering::Relaxed),
            config_rejected: self.config_rejected.load(Ordering::Relaxed),
            avg_tick_latency_us: if count > 0 { sum / count } else { 0 },
            max_tick_latency_us: max,
            lat_buckets: buckets,
            lat_p50_us: percentile_from_buckets(&buckets, 0.50),
            lat_p99_us: percentile_from_buckets(&buckets, 0.99),
        }
    }
}

/// Point-in-time metrics snapshot
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub ticks_total: u64,
    pub frames_total: u64,
    pub frames_per_sec: f64,
    pub acquisition_timeouts: u64,
    pub worker_restarts: u64,
    pub frames_superseded: u64,
    pub cycles_total: u64,
    pub part_1_total: u64,
    pub part_2_total: u64,
    pub persist_failures: u64,
    pub telemetry_published: u64,
    pub telemetry_dropped: u64,
    pub broker_reconnects: u64,
    pub config_reloads: u64,
    pub config_rejected: u64,
    pub avg_tick_latency_us: u64,
    pub max_tick_latency_us: u64,
    pub lat_buckets: [u64; METRICS_NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p99_us: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            ticks_total = %self.ticks_total,
            frames_per_sec = format!("{:.1}", self.frames_per_sec),
            acquisition_timeouts = %self.acquisition_timeouts,
            worker_restarts = %self.worker_restarts,
            cycles_total = %self.cycles_total,
            part_1_total = %self.part_1_total,
            part_2_total = %self.part_2_total,
            persist_failures = %self.persist_failures,
            telemetry_published = %self.telemetry_published,
            telemetry_dropped = %self.telemetry_dropped,
            avg_tick_us = %self.avg_tick_latency_us,
            p99_tick_us = %self.lat_p99_us,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(500), 0);
        assert_eq!(bucket_index(501), 1);
        assert_eq!(bucket_index(256_000), 9);
        assert_eq!(bucket_index(256_001), 10);
    }

    #[test]
    fn test_report_resets_interval_values() {
        let metrics = Metrics::new();
        metrics.record_tick_latency(300);
        metrics.record_tick_latency(900);
        metrics.record_frame();

        let summary = metrics.report();
        assert_eq!(summary.avg_tick_latency_us, 600);
        assert_eq!(summary.max_tick_latency_us, 900);
        assert_eq!(summary.lat_buckets[0], 1);
        assert_eq!(summary.lat_buckets[1], 1);
        assert_eq!(summary.frames_total, 1);

        let again = metrics.report();
        assert_eq!(again.avg_tick_latency_us, 0);
        assert_eq!(again.max_tick_latency_us, 0);
        assert_eq!(again.frames_total, 1);
    }

    #[test]
    fn test_percentile_computation() {
        let metrics = Metrics::new();
        for _ in 0..100 {
            metrics.record_tick_latency(1_500);
        }
        let summary = metrics.report();
        assert_eq!(summary.lat_p50_us, 2_000);
        assert_eq!(summary.lat_p99_us, 2_000);
    }

    #[test]
    fn test_cycle_and_telemetry_counters() {
        let metrics = Metrics::new();
        metrics.record_cycle(true, false);
        metrics.record_cycle(false, true);
        metrics.record_cycle(false, false);
        metrics.record_telemetry(true);
        metrics.record_telemetry(false);

        let summary = metrics.report();
        assert_eq!(summary.cycles_total, 3);
        assert_eq!(summary.part_1_total, 1);
        assert_eq!(summary.part_2_total, 1);
        assert_eq!(metrics.telemetry_published(), 1);
        assert_eq!(metrics.telemetry_dropped(), 1);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let metrics = Arc::new(Metrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = metrics.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        m.record_frames_superseded(1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(metrics.report().frames_superseded, 8000);
    }
}
