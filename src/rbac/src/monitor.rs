//! Transaction metrics for the assignment coordinator
//!
//! Counters are plain atomics so every caller can record without taking a
//! lock. Min and max durations use compare-and-swap loops; the average is
//! derived on read.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

/// Thresholds for [`TransactionMonitor::is_healthy`]
#[derive(Debug, Clone, PartialEq)]
pub struct HealthThresholds {
    /// Below this many operations the monitor always reports healthy
    pub min_samples: u64,

    /// Highest tolerated failure ratio (0.0 - 1.0)
    pub max_failure_ratio: f64,

    /// Highest tolerated average duration
    pub max_avg_duration: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            min_samples: 10,
            max_failure_ratio: 0.05,
            max_avg_duration: Duration::from_secs(1),
        }
    }
}

/// Snapshot of transaction counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionMetrics {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub avg_duration: Duration,
    pub min_duration: Duration,
    pub max_duration: Duration,
    pub window_start: DateTime<Utc>,
}

impl TransactionMetrics {
    /// Failure ratio, or 0.0 with no samples
    pub fn failure_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.failed as f64 / self.total as f64
        }
    }
}

/// Lock-free transaction counters
#[derive(Debug)]
pub struct TransactionMonitor {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    total_nanos: AtomicU64,
    min_nanos: AtomicU64,
    max_nanos: AtomicU64,
    window_start_ms: AtomicI64,
    thresholds: HealthThresholds,
}

impl TransactionMonitor {
    pub fn new() -> Self {
        Self::with_thresholds(HealthThresholds::default())
    }

    pub fn with_thresholds(thresholds: HealthThresholds) -> Self {
        Self {
            total: AtomicU64::new(0),
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            total_nanos: AtomicU64::new(0),
            min_nanos: AtomicU64::new(u64::MAX),
            max_nanos: AtomicU64::new(0),
            window_start_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            thresholds,
        }
    }

    pub fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }

    /// Record one unit of work
    pub fn record(&self, duration: Duration, success: bool) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);

        self.total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);

        let mut current = self.max_nanos.load(Ordering::Relaxed);
        while nanos > current {
            match self.max_nanos.compare_exchange_weak(
                current,
                nanos,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let mut current = self.min_nanos.load(Ordering::Relaxed);
        while nanos < current {
            match self.min_nanos.compare_exchange_weak(
                current,
                nanos,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// Current counters with the derived average
    pub fn get_metrics(&self) -> TransactionMetrics {
        let total = self.total.load(Ordering::Relaxed);
        let total_nanos = self.total_nanos.load(Ordering::Relaxed);
        let min_nanos = self.min_nanos.load(Ordering::Relaxed);

        let avg_duration = if total == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(total_nanos / total)
        };
        let min_duration = if min_nanos == u64::MAX {
            Duration::ZERO
        } else {
            Duration::from_nanos(min_nanos)
        };
        let window_start = Utc
            .timestamp_millis_opt(self.window_start_ms.load(Ordering::Relaxed))
            .single()
            .unwrap_or_else(Utc::now);

        TransactionMetrics {
            total,
            successful: self.successful.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            avg_duration,
            min_duration,
            max_duration: Duration::from_nanos(self.max_nanos.load(Ordering::Relaxed)),
            window_start,
        }
    }

    /// Healthy below `min_samples` operations; otherwise requires the failure
    /// ratio and average duration to stay within their thresholds
    pub fn is_healthy(&self) -> bool {
        let metrics = self.get_metrics();
        if metrics.total < self.thresholds.min_samples {
            return true;
        }

        metrics.failure_rate() <= self.thresholds.max_failure_ratio
            && metrics.avg_duration <= self.thresholds.max_avg_duration
    }

    /// Zero every counter and restart the window
    pub fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.successful.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.total_nanos.store(0, Ordering::Relaxed);
        self.min_nanos.store(u64::MAX, Ordering::Relaxed);
        self.max_nanos.store(0, Ordering::Relaxed);
        self.window_start_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}

impl Default for TransactionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_empty_metrics() {
        let monitor = TransactionMonitor::new();
        let metrics = monitor.get_metrics();

        assert_eq!(metrics.total, 0);
        assert_eq!(metrics.avg_duration, Duration::ZERO);
        assert_eq!(metrics.min_duration, Duration::ZERO);
        assert_eq!(metrics.max_duration, Duration::ZERO);
        assert!(monitor.is_healthy());
    }

    #[test]
    fn test_record_min_max_avg() {
        let monitor = TransactionMonitor::new();

        monitor.record(Duration::from_millis(5), true);
        monitor.record(Duration::from_millis(15), true);
        monitor.record(Duration::from_millis(10), false);

        let metrics = monitor.get_metrics();
        assert_eq!(metrics.total, 3);
        assert_eq!(metrics.successful, 2);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.min_duration, Duration::from_millis(5));
        assert_eq!(metrics.max_duration, Duration::from_millis(15));
        assert_eq!(metrics.avg_duration, Duration::from_millis(10));
    }

    #[test]
    fn test_healthy_below_min_samples() {
        let monitor = TransactionMonitor::new();
        for _ in 0..9 {
            monitor.record(Duration::from_millis(1), false);
        }
        assert!(monitor.is_healthy());

        monitor.record(Duration::from_millis(1), false);
        assert!(!monitor.is_healthy());
    }

    #[test]
    fn test_unhealthy_on_failure_ratio() {
        let monitor = TransactionMonitor::new();
        for _ in 0..94 {
            monitor.record(Duration::from_millis(1), true);
        }
        for _ in 0..5 {
            monitor.record(Duration::from_millis(1), false);
        }
        // 5/99 is just above 5%
        assert!(!monitor.is_healthy());

        monitor.record(Duration::from_millis(1), true);
        // 5/100 is exactly the threshold
        assert!(monitor.is_healthy());
    }

    #[test]
    fn test_unhealthy_on_slow_average() {
        let monitor = TransactionMonitor::new();
        for _ in 0..10 {
            monitor.record(Duration::from_millis(1500), true);
        }
        assert!(!monitor.is_healthy());
    }

    #[test]
    fn test_reset() {
        let monitor = TransactionMonitor::new();
        monitor.record(Duration::from_millis(5), false);
        let before = monitor.get_metrics().window_start;

        thread::sleep(Duration::from_millis(5));
        monitor.reset();

        let metrics = monitor.get_metrics();
        assert_eq!(metrics.total, 0);
        assert_eq!(metrics.failed, 0);
        assert_eq!(metrics.min_duration, Duration::ZERO);
        assert!(metrics.window_start > before);
    }

    #[test]
    fn test_concurrent_recording() {
        let monitor = Arc::new(TransactionMonitor::new());
        let mut handles = vec![];

        for t in 0..8u64 {
            let monitor = Arc::clone(&monitor);
            handles.push(thread::spawn(move || {
                for i in 0..1000u64 {
                    monitor.record(Duration::from_micros(t * 1000 + i + 1), i % 10 != 0);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let metrics = monitor.get_metrics();
        assert_eq!(metrics.total, 8000);
        assert_eq!(metrics.failed, 800);
        assert_eq!(metrics.min_duration, Duration::from_micros(1));
        assert_eq!(metrics.max_duration, Duration::from_micros(8000));
    }
}
