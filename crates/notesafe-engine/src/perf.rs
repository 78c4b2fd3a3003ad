//! Performance tracking
//!
//! [`PerformanceTracker`] aggregates phase timings and outcome counters for
//! every session a processor runs. Each sample is also forwarded to the
//! `metrics` facade so an installed recorder (Prometheus exporter, statsd, ...)
//! sees the same numbers.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Aggregate timing for one phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingStats {
    /// Samples recorded
    pub count: u64,
    /// Sum of samples, seconds
    pub total_secs: f64,
    /// Largest sample, seconds
    pub max_secs: f64,
}

impl TimingStats {
    fn record(&mut self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        self.count += 1;
        self.total_secs += secs;
        self.max_secs = self.max_secs.max(secs);
    }

    /// Mean sample, seconds (0 when empty)
    #[must_use]
    pub fn avg_secs(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let count = self.count as f64;
            self.total_secs / count
        }
    }
}

/// Snapshot of everything the tracker has seen
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// Time spent creating and verifying backups
    pub backup_time: TimingStats,
    /// Time spent inside mutation callbacks
    pub processing_time: TimingStats,
    /// Time spent restoring images
    pub rollback_time: TimingStats,
    /// Notes processed
    pub operations: u64,
    /// Notes committed
    pub successes: u64,
    /// Notes that ended in a failure result
    pub failures: u64,
    /// Rollbacks performed
    pub rollback_count: u64,
    /// Callbacks abandoned for exceeding their budget
    pub timeouts: u64,
    /// Integrity mismatches detected
    pub integrity_failures: u64,
    /// Rollbacks that could not restore every image
    pub rollback_failures: u64,
}

impl PerformanceMetrics {
    /// Flatten into `name -> value` pairs for JSON or Prometheus-style export
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_map(&self) -> BTreeMap<String, f64> {
        let mut map = BTreeMap::new();
        for (phase, stats) in [
            ("backup_time", &self.backup_time),
            ("processing_time", &self.processing_time),
            ("rollback_time", &self.rollback_time),
        ] {
            map.insert(format!("{phase}_count"), stats.count as f64);
            map.insert(format!("{phase}_total_secs"), stats.total_secs);
            map.insert(format!("{phase}_max_secs"), stats.max_secs);
            map.insert(format!("{phase}_avg_secs"), stats.avg_secs());
        }
        for (name, value) in [
            ("operations", self.operations),
            ("successes", self.successes),
            ("failures", self.failures),
            ("rollback_count", self.rollback_count),
            ("timeouts", self.timeouts),
            ("integrity_failures", self.integrity_failures),
            ("rollback_failures", self.rollback_failures),
        ] {
            map.insert(name.to_string(), value as f64);
        }
        map
    }

    /// Fraction of operations that committed
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.operations == 0 {
            0.0
        } else {
            self.successes as f64 / self.operations as f64
        }
    }
}

/// Thread-safe accumulator shared by all sessions of one processor
#[derive(Debug, Default)]
pub struct PerformanceTracker {
    inner: Mutex<PerformanceMetrics>,
}

impl PerformanceTracker {
    /// Create an empty tracker
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a backup phase
    pub fn record_backup(&self, elapsed: Duration) {
        self.inner.lock().backup_time.record(elapsed);
        metrics::histogram!("notesafe_backup_seconds").record(elapsed.as_secs_f64());
    }

    /// Record a callback invocation
    pub fn record_processing(&self, elapsed: Duration) {
        self.inner.lock().processing_time.record(elapsed);
        metrics::histogram!("notesafe_processing_seconds").record(elapsed.as_secs_f64());
    }

    /// Record a rollback
    pub fn record_rollback(&self, elapsed: Duration) {
        let mut inner = self.inner.lock();
        inner.rollback_time.record(elapsed);
        inner.rollback_count += 1;
        drop(inner);
        metrics::histogram!("notesafe_rollback_seconds").record(elapsed.as_secs_f64());
        metrics::counter!("notesafe_rollbacks_total").increment(1);
    }

    /// Record the final outcome of one note
    pub fn record_outcome(&self, success: bool) {
        let mut inner = self.inner.lock();
        inner.operations += 1;
        if success {
            inner.successes += 1;
        } else {
            inner.failures += 1;
        }
        drop(inner);
        let outcome = if success { "success" } else { "failure" };
        metrics::counter!("notesafe_operations_total", "outcome" => outcome).increment(1);
    }

    /// Record a callback timeout
    pub fn record_timeout(&self) {
        self.inner.lock().timeouts += 1;
        metrics::counter!("notesafe_timeouts_total").increment(1);
    }

    /// Record an integrity mismatch
    pub fn record_integrity_failure(&self) {
        self.inner.lock().integrity_failures += 1;
        metrics::counter!("notesafe_integrity_failures_total").increment(1);
    }

    /// Record a rollback that left images unrestored
    pub fn record_rollback_failure(&self) {
        self.inner.lock().rollback_failures += 1;
        metrics::counter!("notesafe_rollback_failures_total").increment(1);
    }

    /// Current totals
    #[must_use]
    pub fn snapshot(&self) -> PerformanceMetrics {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregates_timings() {
        let tracker = PerformanceTracker::new();
        tracker.record_backup(Duration::from_millis(10));
        tracker.record_backup(Duration::from_millis(30));

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.backup_time.count, 2);
        assert!((snapshot.backup_time.total_secs - 0.04).abs() < 1e-9);
        assert!((snapshot.backup_time.max_secs - 0.03).abs() < 1e-9);
        assert!((snapshot.backup_time.avg_secs() - 0.02).abs() < 1e-9);
    }

    #[test]
    fn counts_outcomes_and_rollbacks() {
        let tracker = PerformanceTracker::new();
        tracker.record_outcome(true);
        tracker.record_outcome(false);
        tracker.record_rollback(Duration::from_millis(1));
        tracker.record_timeout();

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.operations, 2);
        assert_eq!(snapshot.successes, 1);
        assert_eq!(snapshot.failures, 1);
        assert_eq!(snapshot.rollback_count, 1);
        assert_eq!(snapshot.timeouts, 1);
        assert!((snapshot.success_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn map_export_has_flat_keys() {
        let tracker = PerformanceTracker::new();
        tracker.record_processing(Duration::from_millis(5));
        let map = tracker.snapshot().as_map();

        assert_eq!(map["processing_time_count"], 1.0);
        assert_eq!(map["rollback_count"], 0.0);
        assert!(map.contains_key("backup_time_avg_secs"));
    }
}
