use super::{check_status, Backend};
use crate::error::BackendError;
use crate::normalize::MetricPoint;
use async_trait::async_trait;
use reqwest::Client;
use std::fmt::Write as _;
use std::time::Duration;
use url::Url;

pub struct InfluxWriter {
    client: Client,
    write_url: Url,
    ping_url: Url,
    token: String,
}

impl InfluxWriter {
    pub fn new(
        base: &Url,
        token: String,
        org: &str,
        bucket: &str,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = Client::builder().timeout(timeout).build()?;
        let mut write_url = join(base, "api/v2/write");
        write_url
            .query_pairs_mut()
            .append_pair("org", org)
            .append_pair("bucket", bucket)
            .append_pair("precision", "s");
        let ping_url = join(base, "ping");
        Ok(Self {
            client,
            write_url,
            ping_url,
            token,
        })
    }
}

fn join(base: &Url, path: &str) -> Url {
    let mut url = base.clone();
    let prefix = url.path().trim_end_matches('/').to_string();
    url.set_path(&format!("{prefix}/{path}"));
    url.set_query(None);
    url
}

pub(crate) fn line_protocol(points: &[MetricPoint]) -> String {
    let mut out = String::with_capacity(points.len() * 96);
    for point in points {
        out.push_str(&escape(&point.measurement, &[',', ' ']));
        for (key, value) in &point.tags {
            if value.is_empty() {
                continue;
            }
            out.push(',');
            out.push_str(&escape(key, &[',', '=', ' ']));
            out.push('=');
            out.push_str(&escape(value, &[',', '=', ' ']));
        }
        let mut first = true;
        for (key, value) in &point.fields {
            if !value.is_finite() {
                continue;
            }
            out.push(if first { ' ' } else { ',' });
            first = false;
            out.push_str(&escape(key, &[',', '=', ' ']));
            let _ = write!(out, "={value}");
        }
        let _ = writeln!(out, " {}", point.timestamp.timestamp());
    }
    out
}

fn escape(raw: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch == '\\' || special.contains(&ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

#[async_trait]
impl Backend for InfluxWriter {
    fn name(&self) -> &'static str {
        "influxdb"
    }

    async fn check_health(&self) -> Result<(), BackendError> {
        let response = self.client.get(self.ping_url.clone()).send().await?;
        check_status(response).await
    }

    async fn write(&self, points: &[MetricPoint]) -> Result<(), BackendError> {
        if points.is_empty() {
            return Ok(());
        }
        let body = line_protocol(points);
        let response = self
            .client
            .post(self.write_url.clone())
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await?;
        check_status(response).await
    }
}
