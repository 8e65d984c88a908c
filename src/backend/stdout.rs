use super::Backend;
use crate::error::BackendError;
use crate::normalize::MetricPoint;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Default)]
pub struct StdoutBackend;

pub(crate) fn render(points: &[MetricPoint]) -> Result<String, BackendError> {
    let mut out = String::new();
    for point in points {
        let line =
            serde_json::to_string(point).map_err(|err| BackendError::Encode(err.to_string()))?;
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

#[async_trait]
impl Backend for StdoutBackend {
    fn name(&self) -> &'static str {
        "stdout"
    }

    async fn write(&self, points: &[MetricPoint]) -> Result<(), BackendError> {
        let rendered = render(points)?;
        let mut stdout = tokio::io::stdout();
        stdout.write_all(rendered.as_bytes()).await?;
        stdout.flush().await?;
        Ok(())
    }
}
