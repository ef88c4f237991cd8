use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Counters shared by every executor of a pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Records acked
    pub completed: AtomicU64,

    /// Attempts that ended the record in `FAILED`
    pub failed: AtomicU64,

    /// Attempts that sent the record back for retry
    pub retried: AtomicU64,

    /// Total handler time across all attempts (milliseconds)
    pub total_execution_time_ms: AtomicU64,

    /// Handlers currently running
    pub active: AtomicU64,
}

/// Point-in-time copy of [`PoolStats`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub active: u64,
    pub avg_execution_time_ms: f64,
}

impl PoolStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, execution_time_ms: u64) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.total_execution_time_ms
            .fetch_add(execution_time_ms, Ordering::Relaxed);
    }

    pub fn record_failure(&self, execution_time_ms: u64) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.total_execution_time_ms
            .fetch_add(execution_time_ms, Ordering::Relaxed);
    }

    pub fn record_retry(&self, execution_time_ms: u64) {
        self.retried.fetch_add(1, Ordering::Relaxed);
        self.total_execution_time_ms
            .fetch_add(execution_time_ms, Ordering::Relaxed);
    }

    pub fn start_job(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn finish_job(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Attempts finished in any way
    pub fn total_attempts(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
            + self.failed.load(Ordering::Relaxed)
            + self.retried.load(Ordering::Relaxed)
    }

    pub fn avg_execution_time_ms(&self) -> f64 {
        let attempts = self.total_attempts();
        if attempts == 0 {
            return 0.0;
        }
        self.total_execution_time_ms.load(Ordering::Relaxed) as f64 / attempts as f64
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            avg_execution_time_ms: self.avg_execution_time_ms(),
        }
    }

    pub fn print_summary(&self) {
        let s = self.snapshot();
        info!(
            completed = s.completed,
            failed = s.failed,
            retried = s.retried,
            active = s.active,
            avg_execution_time_ms = format!("{:.2}", s.avg_execution_time_ms),
            "Worker pool statistics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = PoolStats::new();
        stats.start_job();
        assert_eq!(stats.snapshot().active, 1);

        stats.record_success(100);
        stats.record_retry(40);
        stats.record_failure(10);
        stats.finish_job();

        let s = stats.snapshot();
        assert_eq!((s.completed, s.retried, s.failed, s.active), (1, 1, 1, 0));
        assert_eq!(s.avg_execution_time_ms, 50.0);
    }

    #[test]
    fn test_empty_average() {
        assert_eq!(PoolStats::new().avg_execution_time_ms(), 0.0);
    }
}
