use crate::backend::NEW_RELIC_ENDPOINT;
use crate::dispatcher::{BackendPolicy, ErrorPolicy, MalformedPolicy};
use crate::error::ConfigError;
use crate::normalize::{NameKey, NamingTable, PointStyle};
use crate::reading::TimestampZone;
use crate::sink::Delivery;
use crate::transport::TransportKind;
use dotenvy::dotenv;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use url::Url;

const DEFAULT_SYSLOG_BIND: &str = "0.0.0.0:5514";
const DEFAULT_QUEUE: usize = 10_000;
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 5_000;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MEASUREMENT: &str = "reading";

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    transport: RawTransport,
    #[serde(default)]
    backend: Option<RawBackend>,
    // legacy: {"apikey": .., "names": {..}}
    #[serde(default)]
    apikey: Option<String>,
    #[serde(default)]
    delivery: Option<Delivery>,
    #[serde(default)]
    flush_interval_ms: Option<u64>,
    #[serde(default)]
    names: BTreeMap<NameId, Option<String>>,
    #[serde(default)]
    name_key: NameKey,
    #[serde(default)]
    timezone: TimestampZone,
    #[serde(default)]
    measurement: Option<String>,
    #[serde(default)]
    on_malformed: Option<MalformedPolicy>,
    #[serde(default)]
    on_backend_error: Option<BackendPolicy>,
    #[serde(default)]
    shutdown_timeout_ms: Option<u64>,
    #[serde(default)]
    request_timeout_ms: Option<u64>,
    #[serde(default)]
    otlp_endpoint: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RawTransport {
    #[default]
    Stdin,
    Syslog {
        #[serde(default)]
        bind: Option<String>,
        #[serde(default)]
        queue: Option<usize>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind")]
enum RawBackend {
    #[serde(rename = "newrelic")]
    NewRelic {
        #[serde(default)]
        api_key: String,
        #[serde(default)]
        endpoint: Option<String>,
    },
    #[serde(rename = "influxdb")]
    Influx {
        url: String,
        #[serde(default)]
        token: String,
        org: String,
        bucket: String,
    },
    #[serde(rename = "stdout")]
    Stdout,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(untagged)]
enum NameId {
    Int(i64),
    Text(String),
}

impl NameId {
    fn value(&self) -> Result<i64, ConfigError> {
        match self {
            NameId::Int(id) => Ok(*id),
            NameId::Text(text) => text.trim().parse::<i64>().map_err(|_| {
                ConfigError::Invalid(format!("names: key {text:?} is not an integer"))
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportConfig {
    Stdin,
    Syslog { bind: SocketAddr, queue: usize },
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Stdin => TransportKind::Stream,
            TransportConfig::Syslog { .. } => TransportKind::Listener,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    NewRelic {
        api_key: String,
        endpoint: Url,
    },
    Influx {
        url: Url,
        token: String,
        org: String,
        bucket: String,
    },
    Stdout,
}

impl BackendConfig {
    pub fn name(&self) -> &'static str {
        match self {
            BackendConfig::NewRelic { .. } => "newrelic",
            BackendConfig::Influx { .. } => "influxdb",
            BackendConfig::Stdout => "stdout",
        }
    }

    pub fn point_style(&self) -> PointStyle {
        match self {
            BackendConfig::NewRelic { .. } => PointStyle::Gauges,
            BackendConfig::Influx { .. } | BackendConfig::Stdout => PointStyle::Composite,
        }
    }

    pub fn default_delivery(&self) -> Delivery {
        match self {
            BackendConfig::NewRelic { .. } => Delivery::Batching,
            BackendConfig::Influx { .. } | BackendConfig::Stdout => Delivery::Direct,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub transport: TransportConfig,
    pub backend: BackendConfig,
    pub delivery: Delivery,
    pub flush_interval_ms: u64,
    pub names: NamingTable,
    pub timezone: TimestampZone,
    pub measurement: String,
    pub policy: ErrorPolicy,
    pub shutdown_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        dotenv().ok();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_document(path, &contents, |key| std::env::var(key).ok())
    }

    fn from_document(
        path: &Path,
        contents: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut raw: RawConfig =
            serde_yaml::from_str(contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        apply_env_overrides(&mut raw, &env)?;
        Self::resolve(raw)
    }

    fn resolve(raw: RawConfig) -> Result<Self, ConfigError> {
        let transport = match raw.transport {
            RawTransport::Stdin => TransportConfig::Stdin,
            RawTransport::Syslog { bind, queue } => {
                let bind = bind.as_deref().unwrap_or(DEFAULT_SYSLOG_BIND);
                let bind = bind.trim().parse::<SocketAddr>().map_err(|_| {
                    ConfigError::Invalid(format!("transport.bind: {bind:?} is not a socket address"))
                })?;
                let queue = queue.unwrap_or(DEFAULT_QUEUE);
                if queue == 0 {
                    return Err(invalid("transport.queue must be greater than zero"));
                }
                TransportConfig::Syslog { bind, queue }
            }
        };

        let backend = match (raw.backend, raw.apikey) {
            (Some(_), Some(_)) => {
                return Err(invalid("top-level apikey cannot be combined with backend"))
            }
            (Some(backend), None) => resolve_backend(backend)?,
            (None, Some(api_key)) => resolve_backend(RawBackend::NewRelic {
                api_key,
                endpoint: None,
            })?,
            (None, None) => return Err(invalid("backend is required")),
        };

        let mut names = Vec::with_capacity(raw.names.len());
        for (id, name) in raw.names {
            names.push((id.value()?, name.unwrap_or_default()));
        }

        let mut policy = ErrorPolicy::for_transport(transport.kind());
        if let Some(malformed) = raw.on_malformed {
            policy.malformed = malformed;
        }
        if let Some(backend) = raw.on_backend_error {
            policy.backend = backend;
        }

        let measurement = raw
            .measurement
            .map(|value| value.trim().to_string())
            .unwrap_or_else(|| DEFAULT_MEASUREMENT.to_string());
        if measurement.is_empty() {
            return Err(invalid("measurement must not be empty"));
        }

        let otlp_endpoint = raw
            .otlp_endpoint
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        if let Some(endpoint) = otlp_endpoint.as_deref() {
            parse_url("otlp_endpoint", endpoint)?;
        }

        let config = Self {
            delivery: raw.delivery.unwrap_or_else(|| backend.default_delivery()),
            transport,
            backend,
            flush_interval_ms: non_zero(
                "flush_interval_ms",
                raw.flush_interval_ms.unwrap_or(DEFAULT_FLUSH_INTERVAL_MS),
            )?,
            names: NamingTable::new(raw.name_key, names),
            timezone: raw.timezone,
            measurement,
            policy,
            shutdown_timeout_ms: non_zero(
                "shutdown_timeout_ms",
                raw.shutdown_timeout_ms
                    .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_MS),
            )?,
            request_timeout_ms: non_zero(
                "request_timeout_ms",
                raw.request_timeout_ms.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
            )?,
            otlp_endpoint,
        };
        Ok(config)
    }

    pub fn point_style(&self) -> PointStyle {
        self.backend.point_style()
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn resolve_backend(raw: RawBackend) -> Result<BackendConfig, ConfigError> {
    match raw {
        RawBackend::NewRelic { api_key, endpoint } => {
            let api_key = required("backend.api_key", api_key)?;
            let endpoint = parse_url(
                "backend.endpoint",
                endpoint.as_deref().unwrap_or(NEW_RELIC_ENDPOINT),
            )?;
            Ok(BackendConfig::NewRelic { api_key, endpoint })
        }
        RawBackend::Influx {
            url,
            token,
            org,
            bucket,
        } => Ok(BackendConfig::Influx {
            url: parse_url("backend.url", &url)?,
            token: required("backend.token", token)?,
            org: required("backend.org", org)?,
            bucket: required("backend.bucket", bucket)?,
        }),
        RawBackend::Stdout => Ok(BackendConfig::Stdout),
    }
}

fn apply_env_overrides(
    raw: &mut RawConfig,
    env: &impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    let env_optional = |key: &str| {
        env(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };

    if let RawTransport::Syslog { bind, queue } = &mut raw.transport {
        if let Some(value) = env_optional("SENSOR_RELAY_SYSLOG_BIND") {
            *bind = Some(value);
        }
        if let Some(value) = env_optional("SENSOR_RELAY_QUEUE") {
            *queue = Some(parse_env("SENSOR_RELAY_QUEUE", &value)?);
        }
    }
    if let Some(value) = env_optional("SENSOR_RELAY_FLUSH_INTERVAL_MS") {
        raw.flush_interval_ms = Some(parse_env("SENSOR_RELAY_FLUSH_INTERVAL_MS", &value)?);
    }
    if let Some(value) = env_optional("SENSOR_RELAY_NEW_RELIC_API_KEY") {
        match &mut raw.backend {
            Some(RawBackend::NewRelic { api_key, .. }) => *api_key = value,
            None => raw.apikey = Some(value),
            Some(_) => {}
        }
    }
    if let Some(value) = env_optional("SENSOR_RELAY_INFLUX_TOKEN") {
        if let Some(RawBackend::Influx { token, .. }) = &mut raw.backend {
            *token = value;
        }
    }
    if let Some(value) = env_optional("OTEL_EXPORTER_OTLP_ENDPOINT") {
        raw.otlp_endpoint = Some(value);
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse::<T>()
        .map_err(|_| ConfigError::Invalid(format!("invalid {key}: {value:?}")))
}

fn parse_url(field: &str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value.trim())
        .map_err(|err| ConfigError::Invalid(format!("{field}: {value:?} is not a valid URL ({err})")))
}

fn required(field: &str, value: String) -> Result<String, ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::Invalid(format!("{field} must not be empty")));
    }
    Ok(trimmed.to_string())
}

fn non_zero(field: &str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid(format!("{field} must be greater than zero")));
    }
    Ok(value)
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid(message.to_string())
}
