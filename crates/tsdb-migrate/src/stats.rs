//! Run statistics shared between extraction and import workers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::Error;

/// Synchronized accumulator for one run.
///
/// Workers only ever add to it; [`RunStats::snapshot`] produces the
/// [`RunSummary`] reported at the end.
#[derive(Debug)]
pub struct RunStats {
    started_at: DateTime<Utc>,
    started: Instant,
    tasks_total: AtomicU64,
    tasks_done: AtomicU64,
    chunks_read: AtomicU64,
    chunk_errors: AtomicU64,
    points_submitted: AtomicU64,
    points_written: AtomicU64,
    points_failed: AtomicU64,
    batches_flushed: AtomicU64,
    batches_failed: AtomicU64,
    last_error: Mutex<Option<String>>,
    fatal: Mutex<Option<Error>>,
}

impl Default for RunStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStats {
    /// Starts the clock for a new run.
    #[must_use]
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            started: Instant::now(),
            tasks_total: AtomicU64::new(0),
            tasks_done: AtomicU64::new(0),
            chunks_read: AtomicU64::new(0),
            chunk_errors: AtomicU64::new(0),
            points_submitted: AtomicU64::new(0),
            points_written: AtomicU64::new(0),
            points_failed: AtomicU64::new(0),
            batches_flushed: AtomicU64::new(0),
            batches_failed: AtomicU64::new(0),
            last_error: Mutex::new(None),
            fatal: Mutex::new(None),
        }
    }

    pub(crate) fn set_tasks_total(&self, n: u64) {
        self.tasks_total.store(n, Ordering::Relaxed);
    }

    pub(crate) fn record_task_done(&self) {
        self.tasks_done.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_chunk(&self, points: u64) {
        self.chunks_read.fetch_add(1, Ordering::Relaxed);
        self.points_submitted.fetch_add(points, Ordering::Relaxed);
    }

    pub(crate) fn record_chunk_error(&self, error: &Error) {
        self.chunk_errors.fetch_add(1, Ordering::Relaxed);
        self.set_last_error(error);
    }

    pub(crate) fn record_batch_written(&self, points: u64) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
        self.points_written.fetch_add(points, Ordering::Relaxed);
    }

    pub(crate) fn record_batch_failed(&self, points: u64, error: &Error) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
        self.points_failed.fetch_add(points, Ordering::Relaxed);
        self.set_last_error(error);
    }

    /// Stores the first run-fatal error. Later ones are only logged as last error.
    pub(crate) fn record_fatal(&self, error: Error) {
        self.set_last_error(&error);
        let mut slot = self.fatal.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    pub(crate) fn take_fatal(&self) -> Option<Error> {
        self.fatal.lock().take()
    }

    /// Whether a run-fatal error has been recorded.
    #[must_use]
    pub fn has_fatal(&self) -> bool {
        self.fatal.lock().is_some()
    }

    fn set_last_error(&self, error: &Error) {
        *self.last_error.lock() = Some(error.to_string());
    }

    /// Chunks read so far.
    #[must_use]
    pub fn chunks_read(&self) -> u64 {
        self.chunks_read.load(Ordering::Relaxed)
    }

    /// Batches that failed so far.
    #[must_use]
    pub fn batches_failed(&self) -> u64 {
        self.batches_failed.load(Ordering::Relaxed)
    }

    /// Most recent error message.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Elapsed time since the run started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Copies the current counters into a summary.
    #[must_use]
    pub fn snapshot(&self) -> RunSummary {
        RunSummary {
            started_at: self.started_at,
            finished_at: Utc::now(),
            duration: self.elapsed(),
            tasks_total: self.tasks_total.load(Ordering::Relaxed),
            tasks_done: self.tasks_done.load(Ordering::Relaxed),
            chunks_read: self.chunks_read.load(Ordering::Relaxed),
            chunk_errors: self.chunk_errors.load(Ordering::Relaxed),
            points_submitted: self.points_submitted.load(Ordering::Relaxed),
            points_written: self.points_written.load(Ordering::Relaxed),
            points_failed: self.points_failed.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            last_error: self.last_error(),
        }
    }
}

/// Final (or partial) report of a run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Wall-clock start.
    pub started_at: DateTime<Utc>,
    /// Wall-clock end of the snapshot.
    pub finished_at: DateTime<Utc>,
    /// Monotonic run duration.
    pub duration: Duration,
    /// Read tasks discovered by the source.
    pub tasks_total: u64,
    /// Read tasks fully processed.
    pub tasks_done: u64,
    /// Chunks read and transformed.
    pub chunks_read: u64,
    /// Chunks that failed to read and were skipped.
    pub chunk_errors: u64,
    /// Points handed to the importer.
    pub points_submitted: u64,
    /// Points acknowledged by the target.
    pub points_written: u64,
    /// Points in batches that could not be written.
    pub points_failed: u64,
    /// Batches written successfully.
    pub batches_flushed: u64,
    /// Batches given up on.
    pub batches_failed: u64,
    /// Most recent error message.
    pub last_error: Option<String>,
}

impl RunSummary {
    /// Calculate throughput (points written per second).
    #[must_use]
    pub fn throughput(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.points_written as f64 / secs
        } else {
            0.0
        }
    }

    /// Whether any chunk or batch failed.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.chunk_errors > 0 || self.batches_failed > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_summary_throughput() {
        let mut summary = RunStats::new().snapshot();
        summary.points_written = 1000;
        summary.duration = Duration::from_secs(2);

        assert!((summary.throughput() - 500.0).abs() < 0.001);
    }

    #[test]
    fn test_summary_zero_duration() {
        let mut summary = RunStats::new().snapshot();
        summary.duration = Duration::ZERO;
        assert_eq!(summary.throughput(), 0.0);
    }

    #[test]
    fn test_concurrent_accumulation() {
        let stats = Arc::new(RunStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record_chunk(10);
                        stats.record_batch_written(10);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let summary = stats.snapshot();
        assert_eq!(summary.chunks_read, 8000);
        assert_eq!(summary.points_submitted, 80_000);
        assert_eq!(summary.points_written, 80_000);
        assert!(!summary.has_errors());
    }

    #[test]
    fn test_first_fatal_wins() {
        let stats = RunStats::new();
        stats.record_fatal(Error::SourceConnection("first".into()));
        stats.record_fatal(Error::TargetConnection("second".into()));

        assert!(stats.has_fatal());
        assert!(matches!(stats.take_fatal(), Some(Error::SourceConnection(_))));
        assert!(stats.last_error().unwrap().contains("second"));
    }

    #[test]
    fn test_errors_flag() {
        let stats = RunStats::new();
        stats.record_batch_failed(15, &Error::WriteFatal("400".into()));
        let summary = stats.snapshot();
        assert!(summary.has_errors());
        assert_eq!(summary.points_failed, 15);
    }
}
