use super::{check_status, Backend};
use crate::error::BackendError;
use crate::normalize::{MetricPoint, FIELD_VALUE};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

pub const DEFAULT_ENDPOINT: &str = "https://metric-api.newrelic.com/metric/v1";

pub struct NewRelicMetrics {
    client: Client,
    endpoint: Url,
    api_key: String,
}

#[derive(Serialize)]
struct MetricBatch<'a> {
    metrics: Vec<Gauge<'a>>,
}

#[derive(Serialize)]
struct Gauge<'a> {
    name: String,
    #[serde(rename = "type")]
    kind: &'static str,
    value: f64,
    timestamp: i64,
    attributes: &'a BTreeMap<String, String>,
}

impl NewRelicMetrics {
    pub fn new(api_key: String, endpoint: Url, timeout: Duration) -> Result<Self, BackendError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint,
            api_key,
        })
    }
}

fn gauge_batch(points: &[MetricPoint]) -> [MetricBatch<'_>; 1] {
    let metrics = points
        .iter()
        .flat_map(|point| {
            point.fields.iter().map(move |(field, value)| Gauge {
                name: if field == FIELD_VALUE {
                    point.measurement.clone()
                } else {
                    format!("{}.{}", point.measurement, field)
                },
                kind: "gauge",
                value: *value,
                timestamp: point.timestamp.timestamp_millis(),
                attributes: &point.tags,
            })
        })
        .collect();
    [MetricBatch { metrics }]
}

#[async_trait]
impl Backend for NewRelicMetrics {
    fn name(&self) -> &'static str {
        "newrelic"
    }

    async fn write(&self, points: &[MetricPoint]) -> Result<(), BackendError> {
        if points.is_empty() {
            return Ok(());
        }
        let response = self
            .client
            .post(self.endpoint.clone())
            .header("Api-Key", &self.api_key)
            .json(&gauge_batch(points))
            .send()
            .await?;
        check_status(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{NameKey, NamingTable, Normalizer, PointStyle};
    use crate::reading::{Reading, TimestampZone};
    use std::sync::Arc;

    fn points(style: PointStyle) -> Vec<MetricPoint> {
        let table = NamingTable::new(NameKey::DeviceId, [(1, "porch".to_string())]);
        Normalizer::new(Arc::new(table), style, TimestampZone::Utc, "reading")
            .normalize(&Reading {
                time: "2021-06-01 12:00:00".to_string(),
                device_id: 1,
                channel: 0,
                battery_ok: 1,
                temperature_c: 20.0,
                humidity: 55,
            })
            .unwrap()
    }

    #[test]
    fn gauges_map_to_metric_names() {
        let body = serde_json::to_value(gauge_batch(&points(PointStyle::Gauges))).unwrap();
        let metrics = body[0]["metrics"].as_array().unwrap();
        assert_eq!(metrics.len(), 3);
        assert_eq!(metrics[0]["name"], "temperature");
        assert_eq!(metrics[0]["type"], "gauge");
        assert_eq!(metrics[0]["value"], 68.0);
        assert_eq!(metrics[0]["timestamp"], 1_622_548_800_000_i64);
        assert_eq!(metrics[0]["attributes"]["name"], "porch");
        assert_eq!(metrics[0]["attributes"]["id"], "1");
        assert_eq!(metrics[0]["attributes"]["channel"], "0");
        assert_eq!(metrics[1]["name"], "humidity");
        assert_eq!(metrics[2]["name"], "battery");
    }

    #[test]
    fn composite_fields_are_prefixed() {
        let body = serde_json::to_value(gauge_batch(&points(PointStyle::Composite))).unwrap();
        let names: Vec<&str> = body[0]["metrics"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            [
                "reading.battery",
                "reading.humidity",
                "reading.temperature_c",
                "reading.temperature_f"
            ]
        );
    }
}
