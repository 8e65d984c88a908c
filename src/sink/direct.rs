use super::Sink;
use crate::backend::Backend;
use crate::error::BackendError;
use crate::normalize::MetricPoint;
use crate::stats::IngestStats;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

pub struct DirectSink {
    backend: Arc<dyn Backend>,
    stats: Arc<IngestStats>,
}

impl DirectSink {
    pub fn new(backend: Arc<dyn Backend>, stats: Arc<IngestStats>) -> Self {
        Self { backend, stats }
    }
}

#[async_trait]
impl Sink for DirectSink {
    async fn submit(&mut self, points: Vec<MetricPoint>) -> Result<(), BackendError> {
        let started = Instant::now();
        match self.backend.write(&points).await {
            Ok(()) => {
                self.stats.record_flush(points.len(), started.elapsed());
                tracing::trace!(backend = self.backend.name(), len = points.len(), "wrote points");
                Ok(())
            }
            Err(err) => {
                self.stats.record_error(err.to_string());
                Err(err)
            }
        }
    }

    async fn flush(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        self.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_points, RecordingBackend};

    #[tokio::test]
    async fn writes_each_submission_immediately() {
        let backend = RecordingBackend::new();
        let stats = Arc::new(IngestStats::new());
        let mut sink = DirectSink::new(backend.clone(), stats.clone());

        sink.submit(sample_points(3)).await.unwrap();
        assert_eq!(backend.batches().len(), 1);
        sink.submit(sample_points(1)).await.unwrap();
        sink.flush().await.unwrap();

        let batches = backend.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[1].len(), 1);
        assert_eq!(stats.snapshot().flushed_points, 4);
    }

    #[tokio::test]
    async fn write_failure_belongs_to_the_submission() {
        let backend = RecordingBackend::failing();
        let stats = Arc::new(IngestStats::new());
        let mut sink = DirectSink::new(backend.clone(), stats.clone());

        let err = sink.submit(sample_points(3)).await.unwrap_err();
        assert!(matches!(err, BackendError::Status { status: 503, .. }));
        assert!(sink.take_flush_failure().is_none());
        assert!(stats.last_error().is_some());
    }
}
