
use crate::error::{BackendError, PipelineError};
use crate::normalize::Normalizer;
use crate::reading::parse_reading;
use crate::sink::Sink;
use crate::stats::{IngestStats, StatsSnapshot};
use crate::transport::{Pulled, RawPayload, Transport, TransportKind};
use serde::Deserialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedPolicy {
    Skip,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendPolicy {
    Continue,
    Abort,
}

// Timestamp errors always skip; input errors are always fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorPolicy {
    pub malformed: MalformedPolicy,
    pub backend: BackendPolicy,
}

impl ErrorPolicy {
    pub fn for_transport(kind: TransportKind) -> Self {
        Self {
            malformed: MalformedPolicy::Skip,
            backend: match kind {
                TransportKind::Stream => BackendPolicy::Abort,
                TransportKind::Listener => BackendPolicy::Continue,
            },
        }
    }
}

pub struct Dispatcher {
    transport: Box<dyn Transport>,
    normalizer: Normalizer,
    sink: Box<dyn Sink>,
    policy: ErrorPolicy,
    shutdown_timeout: Duration,
    stats: Arc<IngestStats>,
    state: DispatchState,
}

impl Dispatcher {
    pub fn new(
        transport: Box<dyn Transport>,
        normalizer: Normalizer,
        sink: Box<dyn Sink>,
        policy: ErrorPolicy,
        shutdown_timeout: Duration,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            transport,
            normalizer,
            sink,
            policy,
            shutdown_timeout,
            stats,
            state: DispatchState::Running,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> DispatchState {
        self.state
    }

    fn transition(&mut self, next: DispatchState) {
        tracing::debug!(from = ?self.state, to = ?next, "dispatcher state");
        self.state = next;
    }

    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<StatsSnapshot, PipelineError> {
        tracing::info!(
            transport = ?self.transport.kind(),
            style = ?self.normalizer.style(),
            policy = ?self.policy,
            "dispatcher running"
        );
        let outcome = self.pump(cancel).await;
        if outcome.is_ok() {
            self.transition(DispatchState::Draining);
        }
        let drained = self.drain().await;
        self.transition(DispatchState::Stopped);

        let snapshot = self.stats.snapshot();
        tracing::info!(
            received = snapshot.received,
            submitted = snapshot.submitted,
            malformed = snapshot.malformed,
            bad_timestamps = snapshot.bad_timestamps,
            backend_failures = snapshot.backend_failures,
            dropped_datagrams = snapshot.dropped_datagrams,
            dropped_points = snapshot.dropped_points,
            flushed_points = snapshot.flushed_points,
            avg_flush_micros = self.stats.average_flush_micros.load(Ordering::Relaxed),
            last_error = ?self.stats.last_error(),
            "dispatcher stopped"
        );

        outcome?;
        match drained {
            Err(err) if self.policy.backend == BackendPolicy::Abort => Err(err.into()),
            _ => Ok(snapshot),
        }
    }

    async fn pump(&mut self, cancel: &CancellationToken) -> Result<(), PipelineError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => Next::Cancelled,
                pulled = self.transport.pull() => Next::Pulled(pulled?),
                err = self.sink.flush_failed() => Next::FlushFailed(err),
            };

            match next {
                Next::Cancelled => {
                    tracing::info!("shutdown requested; draining");
                    // Whatever the transport already holds is still processed.
                    while let Some(pulled) = self.transport.try_pull() {
                        if !self.handle(pulled).await? {
                            break;
                        }
                    }
                    return Ok(());
                }
                Next::FlushFailed(err) => self.on_flush_failure(err)?,
                Next::Pulled(pulled) => {
                    if !self.handle(pulled).await? {
                        tracing::info!("input exhausted; draining");
                        return Ok(());
                    }
                }
            }
        }
    }

    // Ok(false) once the transport has ended.
    async fn handle(&mut self, pulled: Pulled) -> Result<bool, PipelineError> {
        match pulled {
            Pulled::End => return Ok(false),
            Pulled::Malformed { raw, error } => {
                IngestStats::incr(&self.stats.received);
                self.reject(&raw, error.into())?;
            }
            Pulled::Payload(raw) => {
                IngestStats::incr(&self.stats.received);
                self.process(raw).await?;
            }
        }

        while let Some(err) = self.sink.take_flush_failure() {
            self.on_flush_failure(err)?;
        }
        Ok(true)
    }

    async fn process(&mut self, raw: RawPayload) -> Result<(), PipelineError> {
        let reading = match parse_reading(&raw.bytes) {
            Ok(reading) => reading,
            Err(err) => return self.reject(&raw, err.into()),
        };

        let points = match self.normalizer.normalize(&reading) {
            Ok(points) => points,
            Err(err) => {
                IngestStats::incr(&self.stats.bad_timestamps);
                tracing::warn!(
                    origin = %raw.origin,
                    payload = %raw.lossy(),
                    error = %err,
                    "discarding reading with invalid timestamp"
                );
                return Ok(());
            }
        };

        match self.sink.submit(points).await {
            Ok(()) => {
                IngestStats::incr(&self.stats.submitted);
                tracing::trace!(origin = %raw.origin, id = reading.device_id, "submitted reading");
                Ok(())
            }
            Err(err) => {
                IngestStats::incr(&self.stats.backend_failures);
                tracing::error!(
                    origin = %raw.origin,
                    payload = %raw.lossy(),
                    error = %err,
                    policy = ?self.policy.backend,
                    "failed to submit reading"
                );
                match self.policy.backend {
                    BackendPolicy::Abort => Err(err.into()),
                    BackendPolicy::Continue => Ok(()),
                }
            }
        }
    }

    fn reject(&self, raw: &RawPayload, err: PipelineError) -> Result<(), PipelineError> {
        IngestStats::incr(&self.stats.malformed);
        match self.policy.malformed {
            MalformedPolicy::Skip => {
                tracing::warn!(
                    kind = err.kind(),
                    field = ?parse_field(&err),
                    origin = %raw.origin,
                    payload = %raw.lossy(),
                    error = %err,
                    "skipping malformed payload"
                );
                Ok(())
            }
            MalformedPolicy::Abort => {
                tracing::error!(
                    kind = err.kind(),
                    field = ?parse_field(&err),
                    origin = %raw.origin,
                    payload = %raw.lossy(),
                    error = %err,
                    "malformed payload"
                );
                Err(err)
            }
        }
    }

    fn on_flush_failure(&self, err: BackendError) -> Result<(), PipelineError> {
        IngestStats::incr(&self.stats.backend_failures);
        match self.policy.backend {
            BackendPolicy::Abort => {
                tracing::error!(error = %err, "batch flush failed; aborting");
                Err(err.into())
            }
            BackendPolicy::Continue => {
                tracing::debug!(error = %err, "batch flush failed; continuing");
                Ok(())
            }
        }
    }

    // First failure wins: a batch lost before shutdown, then the final flush.
    async fn drain(&mut self) -> Result<(), BackendError> {
        let timeout = self.shutdown_timeout;
        let closed = match tokio::time::timeout(timeout, self.sink.close()).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(timeout)),
        };

        let mut first = None;
        while let Some(err) = self.sink.take_flush_failure() {
            IngestStats::incr(&self.stats.backend_failures);
            tracing::warn!(error = %err, "batch flush failed before shutdown");
            first.get_or_insert(err);
        }
        if let Err(err) = closed {
            IngestStats::incr(&self.stats.backend_failures);
            tracing::error!(error = %err, "final flush failed");
            first.get_or_insert(err);
        }
        first.map_or(Ok(()), Err)
    }
}

enum Next {
    Cancelled,
    Pulled(Pulled),
    FlushFailed(BackendError),
}

fn parse_field(err: &PipelineError) -> Option<&'static str> {
    match err {
        PipelineError::Parse(parse) => parse.field(),
        _ => None,
    }
}
