use super::Sink;
use crate::backend::Backend;
use crate::error::BackendError;
use crate::normalize::MetricPoint;
use crate::stats::IngestStats;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub struct Harvester {
    shared: Arc<Shared>,
    failures: mpsc::UnboundedReceiver<BackendError>,
    cancel: CancellationToken,
    timer: Option<JoinHandle<()>>,
}

struct Shared {
    buffer: Mutex<Vec<MetricPoint>>,
    // Serializes transmissions so batches leave in drain order.
    gate: tokio::sync::Mutex<()>,
    backend: Arc<dyn Backend>,
    stats: Arc<IngestStats>,
    capacity: usize,
}

impl Harvester {
    pub fn spawn(
        backend: Arc<dyn Backend>,
        interval: Duration,
        capacity: usize,
        stats: Arc<IngestStats>,
    ) -> Self {
        let shared = Arc::new(Shared {
            buffer: Mutex::new(Vec::with_capacity(capacity)),
            gate: tokio::sync::Mutex::new(()),
            backend,
            stats,
            capacity,
        });
        let (failures_tx, failures) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let timer = tokio::spawn(run_timer(
            shared.clone(),
            interval,
            failures_tx,
            cancel.clone(),
        ));
        Self {
            shared,
            failures,
            cancel,
            timer: Some(timer),
        }
    }

    #[cfg(test)]
    pub fn buffered(&self) -> usize {
        self.shared.lock_buffer().len()
    }
}

impl Drop for Harvester {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Shared {
    fn lock_buffer(&self) -> std::sync::MutexGuard<'_, Vec<MetricPoint>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn harvest(&self) -> Result<usize, BackendError> {
        let _gate = self.gate.lock().await;
        let batch = std::mem::replace(&mut *self.lock_buffer(), Vec::with_capacity(self.capacity));
        if batch.is_empty() {
            return Ok(0);
        }

        let len = batch.len();
        let started = Instant::now();
        match self.backend.write(&batch).await {
            Ok(()) => {
                let elapsed = started.elapsed();
                self.stats.record_flush(len, elapsed);
                tracing::debug!(
                    backend = self.backend.name(),
                    len,
                    micros = elapsed.as_micros() as u64,
                    "flushed metrics batch"
                );
                Ok(len)
            }
            Err(err) => {
                self.stats
                    .dropped_points
                    .fetch_add(len as u64, std::sync::atomic::Ordering::Relaxed);
                self.stats.record_error(err.to_string());
                tracing::error!(
                    backend = self.backend.name(),
                    error = %err,
                    dropped = len,
                    "failed to flush metrics batch; batch dropped"
                );
                Err(err)
            }
        }
    }
}

async fn run_timer(
    shared: Arc<Shared>,
    interval: Duration,
    failures: mpsc::UnboundedSender<BackendError>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(err) = shared.harvest().await {
                    let _ = failures.send(err);
                }
            }
        }
    }
}

#[async_trait]
impl Sink for Harvester {
    async fn submit(&mut self, points: Vec<MetricPoint>) -> Result<(), BackendError> {
        self.shared.lock_buffer().extend(points);
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), BackendError> {
        self.shared.harvest().await.map(|_| ())
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        self.cancel.cancel();
        if let Some(timer) = self.timer.take() {
            let _ = timer.await;
        }
        self.flush().await
    }

    fn take_flush_failure(&mut self) -> Option<BackendError> {
        self.failures.try_recv().ok()
    }

    async fn flush_failed(&mut self) -> BackendError {
        match self.failures.recv().await {
            Some(err) => err,
            // Timer task is gone; nothing more can fail in the background.
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_points, RecordingBackend};
    use std::sync::atomic::Ordering;

    const LONG: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn explicit_flush_delivers_everything_submitted_before_it() {
        let backend = RecordingBackend::new();
        let stats = Arc::new(IngestStats::new());
        let mut sink = Harvester::spawn(backend.clone(), LONG, 1, stats.clone());

        sink.submit(sample_points(1)).await.unwrap();
        sink.submit(sample_points(1)).await.unwrap();
        assert_eq!(sink.buffered(), 2);
        assert!(backend.batches().is_empty());

        sink.flush().await.unwrap();
        let batches = backend.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(sink.buffered(), 0);
        assert_eq!(stats.snapshot().flushed_points, 2);
    }

    #[tokio::test]
    async fn empty_flush_does_not_touch_the_backend() {
        let backend = RecordingBackend::new();
        let mut sink = Harvester::spawn(backend.clone(), LONG, 8, Arc::new(IngestStats::new()));
        sink.flush().await.unwrap();
        sink.close().await.unwrap();
        assert_eq!(backend.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_flushes_in_the_background() {
        let backend = RecordingBackend::new();
        let interval = Duration::from_secs(5);
        let mut sink = Harvester::spawn(backend.clone(), interval, 8, Arc::new(IngestStats::new()));

        sink.submit(sample_points(3)).await.unwrap();
        tokio::time::sleep(interval * 2).await;

        let batches = backend.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
        assert!(sink.take_flush_failure().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_timer_flush_drops_batch_and_reports_it() {
        let backend = RecordingBackend::failing();
        let stats = Arc::new(IngestStats::new());
        let interval = Duration::from_secs(5);
        let mut sink = Harvester::spawn(backend.clone(), interval, 8, stats.clone());

        sink.submit(sample_points(3)).await.unwrap();
        tokio::time::sleep(interval * 2).await;

        assert!(matches!(
            sink.take_flush_failure(),
            Some(BackendError::Status { status: 503, .. })
        ));
        assert!(sink.take_flush_failure().is_none());
        assert_eq!(sink.buffered(), 0);
        assert_eq!(stats.dropped_points.load(Ordering::Relaxed), 3);
        assert_eq!(backend.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_failed_wakes_on_a_timer_failure() {
        let backend = RecordingBackend::failing();
        let interval = Duration::from_secs(5);
        let mut sink = Harvester::spawn(backend.clone(), interval, 8, Arc::new(IngestStats::new()));

        // Nothing buffered, nothing to fail.
        assert!(tokio::time::timeout(interval * 2, sink.flush_failed()).await.is_err());

        sink.submit(sample_points(2)).await.unwrap();
        let err = tokio::time::timeout(interval * 2, sink.flush_failed())
            .await
            .expect("timer failure reported");
        assert!(matches!(err, BackendError::Status { status: 503, .. }));
        assert_eq!(backend.attempts(), 1);
    }

    #[tokio::test]
    async fn close_performs_final_flush() {
        let backend = RecordingBackend::new();
        let mut sink = Harvester::spawn(backend.clone(), LONG, 8, Arc::new(IngestStats::new()));
        sink.submit(sample_points(3)).await.unwrap();
        sink.close().await.unwrap();
        assert_eq!(backend.points().len(), 3);
    }
}
