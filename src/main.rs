mod backend;
mod cli;
mod config;
mod dispatcher;
mod error;
mod normalize;
mod reading;
mod sink;
mod stats;
#[cfg(test)]
mod test_support;
mod transport;

use crate::backend::{Backend, InfluxWriter, NewRelicMetrics, StdoutBackend};
use crate::cli::Args;
use crate::config::{BackendConfig, Config, TransportConfig};
use crate::dispatcher::Dispatcher;
use crate::normalize::Normalizer;
use crate::sink::{Delivery, DirectSink, Harvester, Sink};
use crate::stats::IngestStats;
use crate::transport::{StreamTransport, SyslogListener, Transport};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

const HARVEST_CAPACITY_HINT: usize = 256;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,sensor_relay=info".into());
    // stdout belongs to the stdout backend.
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true);

    let otel_layer = match config.otlp_endpoint.as_deref().map(normalize_otlp_http_endpoint) {
        Some(endpoint) if !endpoint.is_empty() => {
            let exporter = opentelemetry_otlp::new_exporter()
                .http()
                .with_endpoint(endpoint);
            let resource = Resource::new(vec![KeyValue::new("service.name", "sensor-relay")]);
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(exporter)
                .with_trace_config(OTelTraceConfig::default().with_resource(resource))
                .install_batch(Tokio)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        _ => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()?;
    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

fn build_backend(config: &Config) -> Result<Arc<dyn Backend>> {
    let timeout = config.request_timeout();
    let backend: Arc<dyn Backend> = match &config.backend {
        BackendConfig::NewRelic { api_key, endpoint } => Arc::new(NewRelicMetrics::new(
            api_key.clone(),
            endpoint.clone(),
            timeout,
        )?),
        BackendConfig::Influx {
            url,
            token,
            org,
            bucket,
        } => Arc::new(InfluxWriter::new(url, token.clone(), org, bucket, timeout)?),
        BackendConfig::Stdout => Arc::new(StdoutBackend),
    };
    Ok(backend)
}

fn build_sink(config: &Config, backend: Arc<dyn Backend>, stats: Arc<IngestStats>) -> Box<dyn Sink> {
    match config.delivery {
        Delivery::Direct => Box::new(DirectSink::new(backend, stats)),
        Delivery::Batching => Box::new(Harvester::spawn(
            backend,
            config.flush_interval(),
            HARVEST_CAPACITY_HINT,
            stats,
        )),
    }
}

async fn build_transport(
    config: &Config,
    stats: Arc<IngestStats>,
    cancel: CancellationToken,
) -> Result<Box<dyn Transport>> {
    let transport: Box<dyn Transport> = match &config.transport {
        TransportConfig::Stdin => Box::new(StreamTransport::stdin()),
        TransportConfig::Syslog { bind, queue } => {
            let listener = SyslogListener::bind(&bind.to_string(), *queue, stats, cancel)
                .await
                .with_context(|| format!("failed to bind syslog listener on {bind}"))?;
            tracing::info!(local_addr = %listener.local_addr(), queue, "listening for syslog datagrams");
            Box::new(listener)
        }
    };
    Ok(transport)
}

async fn run(config: Config) -> Result<()> {
    init_tracing(&config)?;

    let backend = build_backend(&config)
        .with_context(|| format!("failed to build {} backend", config.backend.name()))?;
    backend
        .check_health()
        .await
        .with_context(|| format!("{} backend health check failed", backend.name()))?;

    let stats = Arc::new(IngestStats::new());
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            signal_cancel.cancel();
        }
    });

    let transport = build_transport(&config, stats.clone(), cancel.clone()).await?;
    let sink = build_sink(&config, backend.clone(), stats.clone());
    let normalizer = Normalizer::new(
        Arc::new(config.names.clone()),
        config.point_style(),
        config.timezone,
        config.measurement.clone(),
    );
    tracing::info!(
        backend = backend.name(),
        delivery = ?config.delivery,
        names = config.names.len(),
        name_key = ?config.names.key(),
        "sensor-relay starting"
    );

    let mut dispatcher = Dispatcher::new(
        transport,
        normalizer,
        sink,
        config.policy,
        config.shutdown_timeout(),
        stats,
    );
    let span = tracing::info_span!("dispatch", backend = backend.name());
    dispatcher
        .run(&cancel)
        .instrument(span)
        .await
        .context("sensor-relay stopped on a fatal error")?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse_or_exit();
    let config = Config::load(&args.config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    let result = runtime.block_on(run(config));
    // A stdin read may still be parked on a blocking thread.
    runtime.shutdown_timeout(Duration::from_millis(250));
    result
}
