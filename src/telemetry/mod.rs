//! Logging, tracing and metrics setup.
//!
//! Log output always goes to stderr through `tracing-subscriber`. With an OTLP
//! endpoint configured, spans, metrics and log records are also exported over
//! gRPC.

pub mod metrics;
pub mod work;

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::config::Config;
use crate::error::{Error, Result};

pub struct TelemetryConfig {
    /// OTLP gRPC endpoint, e.g. `http://localhost:4317`. `None` logs locally only.
    pub endpoint: Option<String>,
    pub service_name: String,
    /// Filter used when `RUST_LOG` is not set.
    pub log_level: String,
}

impl TelemetryConfig {
    pub fn from_config(config: &Config, service_name: impl Into<String>) -> Self {
        Self {
            endpoint: config.otel_endpoint.clone(),
            service_name: service_name.into(),
            log_level: config.log_level.clone(),
        }
    }
}

/// Keeps the OTel providers alive. Dropping it flushes and shuts them down,
/// so hold it until the process is about to exit.
#[derive(Default)]
pub struct TelemetryGuard {
    pipelines: Option<OtlpPipelines>,
}

impl TelemetryGuard {
    /// Whether signals are being exported.
    pub fn is_exporting(&self) -> bool {
        self.pipelines.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        let Some(pipelines) = self.pipelines.take() else {
            return;
        };
        // Logs first: shutting down the tracer can still emit records.
        if let Err(e) = pipelines.logs.shutdown() {
            eprintln!("log exporter shutdown failed: {e}");
        }
        if let Err(e) = pipelines.metrics.shutdown() {
            eprintln!("metric exporter shutdown failed: {e}");
        }
        if let Err(e) = pipelines.traces.shutdown() {
            eprintln!("span exporter shutdown failed: {e}");
        }
    }
}

struct OtlpPipelines {
    traces: SdkTracerProvider,
    metrics: SdkMeterProvider,
    logs: SdkLoggerProvider,
}

impl OtlpPipelines {
    fn build(endpoint: &str, resource: Resource) -> Result<Self> {
        let spans = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("span", e))?;
        let traces = SdkTracerProvider::builder()
            .with_batch_exporter(spans)
            .with_resource(resource.clone())
            .build();

        let measurements = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("metric", e))?;
        let metrics = SdkMeterProvider::builder()
            .with_periodic_exporter(measurements)
            .with_resource(resource.clone())
            .build();

        let records = opentelemetry_otlp::LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("log", e))?;
        let logs = SdkLoggerProvider::builder()
            .with_batch_exporter(records)
            .with_resource(resource)
            .build();

        Ok(Self {
            traces,
            metrics,
            logs,
        })
    }
}

fn exporter_error(signal: &str, e: impl std::fmt::Display) -> Error {
    Error::Other(format!("failed to create OTLP {signal} exporter: {e}"))
}

fn resource(service_name: String) -> Resource {
    Resource::builder()
        .with_service_name(service_name)
        .with_attribute(KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ))
        .build()
}

/// Install the global subscriber, and the OTLP pipelines if an endpoint is set.
///
/// # Errors
///
/// Fails if an exporter cannot be built or a global subscriber is already
/// installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let pipelines = config
        .endpoint
        .as_deref()
        .map(|endpoint| OtlpPipelines::build(endpoint, resource(config.service_name.clone())))
        .transpose()?;

    let (trace_layer, log_layer) = match &pipelines {
        Some(p) => {
            opentelemetry::global::set_meter_provider(p.metrics.clone());
            (
                Some(tracing_opentelemetry::layer().with_tracer(p.traces.tracer("tierq"))),
                Some(
                    opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(&p.logs),
                ),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .with(trace_layer)
        .with(log_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("failed to init tracing subscriber: {e}")))?;

    tracing::debug!(
        service = %config.service_name,
        exporting = pipelines.is_some(),
        "telemetry initialized"
    );
    Ok(TelemetryGuard { pipelines })
}
