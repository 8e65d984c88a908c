use crate::backend::Backend;
use crate::error::{BackendError, PipelineError};
use crate::normalize::MetricPoint;
use crate::sink::Sink;
use crate::transport::{Pulled, Transport, TransportKind};
use async_trait::async_trait;
use chrono::TimeZone;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub fn sample_points(n: usize) -> Vec<MetricPoint> {
    let timestamp = chrono::Utc.with_ymd_and_hms(2021, 6, 1, 12, 0, 0).unwrap();
    (0..n)
        .map(|i| MetricPoint {
            measurement: format!("metric_{i}"),
            tags: BTreeMap::from([("id".to_string(), "1".to_string())]),
            fields: BTreeMap::from([("value".to_string(), i as f64)]),
            timestamp,
        })
        .collect()
}

pub fn unavailable() -> BackendError {
    BackendError::Status {
        status: 503,
        body: "unavailable".to_string(),
    }
}

#[derive(Default)]
pub struct RecordingBackend {
    batches: Mutex<Vec<Vec<MetricPoint>>>,
    attempts: AtomicUsize,
    failing: AtomicBool,
    stalled: AtomicBool,
}

impl RecordingBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let backend = Self::default();
        backend.failing.store(true, Ordering::SeqCst);
        Arc::new(backend)
    }

    // Every write hangs forever.
    pub fn stalled() -> Arc<Self> {
        let backend = Self::default();
        backend.stalled.store(true, Ordering::SeqCst);
        Arc::new(backend)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> Vec<Vec<MetricPoint>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn points(&self) -> Vec<MetricPoint> {
        self.batches().into_iter().flatten().collect()
    }
}

#[async_trait]
impl Backend for RecordingBackend {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn write(&self, points: &[MetricPoint]) -> Result<(), BackendError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.batches.lock().unwrap().push(points.to_vec());
        Ok(())
    }
}

pub struct ScriptedTransport {
    kind: TransportKind,
    script: VecDeque<Pulled>,
    idle: Option<Duration>,
    idle_until: Option<Instant>,
}

impl ScriptedTransport {
    pub fn stream(script: impl IntoIterator<Item = Pulled>) -> Self {
        Self::new(TransportKind::Stream, script)
    }

    pub fn listener(script: impl IntoIterator<Item = Pulled>) -> Self {
        Self::new(TransportKind::Listener, script)
    }

    fn new(kind: TransportKind, script: impl IntoIterator<Item = Pulled>) -> Self {
        Self {
            kind,
            script: script.into_iter().collect(),
            idle: None,
            idle_until: None,
        }
    }

    // A stream that goes quiet for `idle` before it ends.
    pub fn idle_before_end(mut self, idle: Duration) -> Self {
        self.idle = Some(idle);
        self
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn pull(&mut self) -> Result<Pulled, PipelineError> {
        if let Some(item) = self.script.pop_front() {
            return Ok(item);
        }
        if self.kind == TransportKind::Listener {
            return std::future::pending().await;
        }
        if let Some(idle) = self.idle {
            // The deadline survives a pull dropped by the caller's select.
            let until = *self.idle_until.get_or_insert_with(|| Instant::now() + idle);
            tokio::time::sleep_until(until).await;
        }
        Ok(Pulled::End)
    }

    fn try_pull(&mut self) -> Option<Pulled> {
        self.script.pop_front()
    }
}

#[derive(Debug, Default)]
pub struct SinkLog {
    pub submitted: Vec<Vec<MetricPoint>>,
    pub flushes: usize,
    pub closes: usize,
}

#[derive(Default)]
pub struct CountingSink {
    log: Arc<Mutex<SinkLog>>,
    fail_submit: bool,
    pending_failures: VecDeque<BackendError>,
    close_failure: Option<BackendError>,
}

impl CountingSink {
    pub fn new() -> (Self, Arc<Mutex<SinkLog>>) {
        let sink = Self::default();
        let log = sink.log.clone();
        (sink, log)
    }

    pub fn failing_submit(mut self) -> Self {
        self.fail_submit = true;
        self
    }

    pub fn with_flush_failure(mut self, err: BackendError) -> Self {
        self.pending_failures.push_back(err);
        self
    }

    // A background batch that fails while the sink is closing.
    pub fn with_failure_on_close(mut self, err: BackendError) -> Self {
        self.close_failure = Some(err);
        self
    }
}

#[async_trait]
impl Sink for CountingSink {
    async fn submit(&mut self, points: Vec<MetricPoint>) -> Result<(), BackendError> {
        if self.fail_submit {
            return Err(unavailable());
        }
        self.log.lock().unwrap().submitted.push(points);
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), BackendError> {
        self.log.lock().unwrap().flushes += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        self.log.lock().unwrap().closes += 1;
        self.pending_failures.extend(self.close_failure.take());
        Ok(())
    }

    fn take_flush_failure(&mut self) -> Option<BackendError> {
        self.pending_failures.pop_front()
    }
}
