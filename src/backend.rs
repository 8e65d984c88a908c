mod influx;
mod newrelic;
mod stdout;

pub use influx::InfluxWriter;
pub use newrelic::{NewRelicMetrics, DEFAULT_ENDPOINT as NEW_RELIC_ENDPOINT};
pub use stdout::StdoutBackend;

use crate::error::BackendError;
use crate::normalize::MetricPoint;
use async_trait::async_trait;

#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check_health(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn write(&self, points: &[MetricPoint]) -> Result<(), BackendError>;
}

async fn check_status(response: reqwest::Response) -> Result<(), BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(BackendError::Status {
        status: status.as_u16(),
        body: body.chars().take(512).collect(),
    })
}
