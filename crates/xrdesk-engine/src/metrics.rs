//! Fleet metrics collection and reporting.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use xrdesk_ipc::{FleetMetrics, WarningType};

/// Collects acquire-pass timing and fleet counters.
///
/// Shared between the render thread that records and whoever reports.
pub struct FleetMetricsCollector {
    start_time: RwLock<Option<Instant>>,
    slow_threshold: Duration,
    worker_count: AtomicUsize,
    last_acquire_us: AtomicU64,
    max_acquire_us: AtomicU64,
    slow_passes: AtomicU64,
    frames_delivered: AtomicU64,
    rebuilds: AtomicU64,

    /// Slowest pass since the last report.
    slowest_unreported_us: AtomicU64,
    failed_monitors: Mutex<Vec<usize>>,
    behind_monitors: Mutex<Vec<usize>>,
}

impl FleetMetricsCollector {
    /// Creates a collector warning about passes slower than `slow_threshold`.
    pub fn new(slow_threshold: Duration) -> Self {
        Self {
            start_time: RwLock::new(None),
            slow_threshold,
            worker_count: AtomicUsize::new(0),
            last_acquire_us: AtomicU64::new(0),
            max_acquire_us: AtomicU64::new(0),
            slow_passes: AtomicU64::new(0),
            frames_delivered: AtomicU64::new(0),
            rebuilds: AtomicU64::new(0),
            slowest_unreported_us: AtomicU64::new(0),
            failed_monitors: Mutex::new(Vec::new()),
            behind_monitors: Mutex::new(Vec::new()),
        }
    }

    pub fn start(&self) {
        *self.start_time.write() = Some(Instant::now());
    }

    pub fn stop(&self) {
        *self.start_time.write() = None;
    }

    /// Records one acquire pass. Returns true if it was slow.
    pub fn record_acquire_pass(&self, elapsed: Duration) -> bool {
        let us = elapsed.as_micros().min(u64::MAX as u128) as u64;
        self.last_acquire_us.store(us, Ordering::Relaxed);
        self.max_acquire_us.fetch_max(us, Ordering::Relaxed);

        let slow = elapsed > self.slow_threshold;
        if slow {
            self.slow_passes.fetch_add(1, Ordering::Relaxed);
            self.slowest_unreported_us.fetch_max(us, Ordering::Relaxed);
        }
        slow
    }

    pub fn record_frames(&self, count: u64) {
        self.frames_delivered.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_rebuild(&self, worker_count: usize) {
        self.rebuilds.fetch_add(1, Ordering::Relaxed);
        self.worker_count.store(worker_count, Ordering::Relaxed);
    }

    pub fn record_capture_failure(&self, monitor_index: usize) {
        let mut failed = self.failed_monitors.lock();
        if !failed.contains(&monitor_index) {
            failed.push(monitor_index);
        }
    }

    pub fn record_falling_behind(&self, monitor_index: usize) {
        let mut behind = self.behind_monitors.lock();
        if !behind.contains(&monitor_index) {
            behind.push(monitor_index);
        }
    }

    /// Current metrics snapshot.
    pub fn snapshot(&self) -> FleetMetrics {
        let uptime_seconds = self
            .start_time
            .read()
            .map(|s| s.elapsed().as_secs())
            .unwrap_or(0);

        FleetMetrics {
            worker_count: self.worker_count.load(Ordering::Relaxed),
            last_acquire_us: self.last_acquire_us.load(Ordering::Relaxed),
            max_acquire_us: self.max_acquire_us.load(Ordering::Relaxed),
            slow_passes: self.slow_passes.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            rebuilds: self.rebuilds.load(Ordering::Relaxed),
            uptime_seconds,
        }
    }

    /// Warnings accumulated since the last [`FleetMetricsCollector::mark_reported`].
    pub fn check_warnings(&self) -> Vec<WarningType> {
        let mut warnings = Vec::new();

        let slowest = self.slowest_unreported_us.load(Ordering::Relaxed);
        if slowest > 0 {
            warnings.push(WarningType::SlowAcquire { elapsed_us: slowest });
        }
        for &monitor_index in self.failed_monitors.lock().iter() {
            warnings.push(WarningType::CaptureFailed { monitor_index });
        }
        for &monitor_index in self.behind_monitors.lock().iter() {
            warnings.push(WarningType::RenderingFallingBehind { monitor_index });
        }

        warnings
    }

    /// Clears the warnings that were just reported.
    pub fn mark_reported(&self) {
        self.slowest_unreported_us.store(0, Ordering::Relaxed);
        self.failed_monitors.lock().clear();
        self.behind_monitors.lock().clear();
        debug!("Fleet metrics reported");
    }
}

impl Default for FleetMetricsCollector {
    fn default() -> Self {
        Self::new(Duration::from_millis(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_pass_timing() {
        let metrics = FleetMetricsCollector::default();
        assert!(!metrics.record_acquire_pass(Duration::from_micros(800)));
        assert!(metrics.record_acquire_pass(Duration::from_micros(7_500)));
        assert!(!metrics.record_acquire_pass(Duration::from_micros(1_200)));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.last_acquire_us, 1_200);
        assert_eq!(snapshot.max_acquire_us, 7_500);
        assert_eq!(snapshot.slow_passes, 1);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let metrics = FleetMetricsCollector::new(Duration::from_millis(5));
        assert!(!metrics.record_acquire_pass(Duration::from_millis(5)));
        assert!(metrics.check_warnings().is_empty());
    }

    #[test]
    fn test_warnings_until_reported() {
        let metrics = FleetMetricsCollector::default();
        metrics.record_acquire_pass(Duration::from_millis(6));
        metrics.record_acquire_pass(Duration::from_millis(9));
        metrics.record_capture_failure(2);
        metrics.record_capture_failure(2);
        metrics.record_falling_behind(0);

        assert_eq!(
            metrics.check_warnings(),
            vec![
                WarningType::SlowAcquire { elapsed_us: 9_000 },
                WarningType::CaptureFailed { monitor_index: 2 },
                WarningType::RenderingFallingBehind { monitor_index: 0 },
            ]
        );

        metrics.mark_reported();
        assert!(metrics.check_warnings().is_empty());
        // Totals survive reporting
        assert_eq!(metrics.snapshot().slow_passes, 2);
    }

    #[test]
    fn test_rebuild_and_frame_counters() {
        let metrics = FleetMetricsCollector::default();
        metrics.start();
        metrics.record_rebuild(3);
        metrics.record_rebuild(2);
        metrics.record_frames(4);
        metrics.record_frames(1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.rebuilds, 2);
        assert_eq!(snapshot.worker_count, 2);
        assert_eq!(snapshot.frames_delivered, 5);

        metrics.stop();
        assert_eq!(metrics.snapshot().uptime_seconds, 0);
    }
}
