mod direct;
mod harvester;

pub use direct::DirectSink;
pub use harvester::Harvester;

use crate::error::BackendError;
use crate::normalize::MetricPoint;
use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    Direct,
    Batching,
}

#[async_trait]
pub trait Sink: Send {
    // An error here belongs to the submitted reading.
    async fn submit(&mut self, points: Vec<MetricPoint>) -> Result<(), BackendError>;

    async fn flush(&mut self) -> Result<(), BackendError>;

    async fn close(&mut self) -> Result<(), BackendError>;

    fn take_flush_failure(&mut self) -> Option<BackendError> {
        None
    }

    // Resolves with the next background flush failure; pending if there are none.
    async fn flush_failed(&mut self) -> BackendError {
        std::future::pending().await
    }
}
