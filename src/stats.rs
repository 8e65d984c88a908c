use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct IngestStats {
    pub received: AtomicU64,
    pub submitted: AtomicU64,
    pub malformed: AtomicU64,
    pub bad_timestamps: AtomicU64,
    pub backend_failures: AtomicU64,
    pub dropped_datagrams: AtomicU64,
    pub queue_depth: AtomicU64,
    pub flushed_points: AtomicU64,
    pub dropped_points: AtomicU64,
    pub last_flush_unix_ms: AtomicU64,
    pub last_batch_len: AtomicU64,
    pub average_flush_micros: AtomicU64,
    last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub submitted: u64,
    pub malformed: u64,
    pub bad_timestamps: u64,
    pub backend_failures: u64,
    pub dropped_datagrams: u64,
    pub flushed_points: u64,
    pub dropped_points: u64,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        *self.lock_last_error() = Some(err.into());
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock_last_error().clone()
    }

    fn lock_last_error(&self) -> MutexGuard<'_, Option<String>> {
        self.last_error.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_flush(&self, len: usize, elapsed: Duration) {
        self.flushed_points.fetch_add(len as u64, Ordering::Relaxed);
        self.last_batch_len.store(len as u64, Ordering::Relaxed);
        let now = Utc::now().timestamp_millis() as u64;
        self.last_flush_unix_ms.store(now, Ordering::Relaxed);
        let micros = elapsed.as_micros() as u64;
        let prev = self.average_flush_micros.load(Ordering::Relaxed);
        let avg = if prev == 0 { micros } else { (prev + micros) / 2 };
        self.average_flush_micros.store(avg, Ordering::Relaxed);
        // A successful flush supersedes the last failure.
        *self.lock_last_error() = None;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            bad_timestamps: self.bad_timestamps.load(Ordering::Relaxed),
            backend_failures: self.backend_failures.load(Ordering::Relaxed),
            dropped_datagrams: self.dropped_datagrams.load(Ordering::Relaxed),
            flushed_points: self.flushed_points.load(Ordering::Relaxed),
            dropped_points: self.dropped_points.load(Ordering::Relaxed),
        }
    }
}
