//! Process-wide logging, tracing and metrics setup.
//!
//! - [`init_tracing`]: `tracing` subscriber with env filter, fmt output, an
//!   optional Logstash forwarding layer and optional OTLP span export
//! - [`init_metrics`]: OpenTelemetry meter provider exported through a
//!   Prometheus registry

use std::time::Duration;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::{Tracer, TracerProvider};
use prometheus::Registry;
use serde::{Deserialize, Serialize};
use strum_macros::AsRefStr;
use thiserror::Error;
use tracing::Subscriber;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::sink::logstash::LogstashLayer;

/// Service name reported in the metrics resource.
pub const SERVICE_NAME: &str = "netpulse";

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "info,netpulse=debug";

/// Default OTLP gRPC collector endpoint.
pub const DEFAULT_TRACE_ENDPOINT: &str = "http://jaeger:4317";

/// Default OTLP export timeout (10 seconds).
pub const DEFAULT_TRACE_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors raised while setting up telemetry.
#[derive(Debug, Error, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum TelemetryError {
    /// A global subscriber was already installed.
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),

    /// The Prometheus or OTLP exporter could not be built.
    #[error("failed to build exporter: {0}")]
    Exporter(String),

    /// Flushing or shutting down a provider failed.
    #[error("provider shutdown failed: {0}")]
    Shutdown(String),

    /// The tracing section is invalid.
    #[error("config error: {0}")]
    Config(String),
}

// =============================================================================
// Span Export
// =============================================================================

fn default_trace_endpoint() -> String {
    DEFAULT_TRACE_ENDPOINT.to_string()
}

fn default_service_name() -> String {
    SERVICE_NAME.to_string()
}

fn default_trace_timeout() -> Duration {
    DEFAULT_TRACE_TIMEOUT
}

/// OTLP span export settings. Span export is off when the section is absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceExportConfig {
    /// OTLP gRPC collector endpoint.
    #[serde(default = "default_trace_endpoint")]
    pub endpoint: String,

    /// `service.name` resource attribute.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Per-batch export timeout.
    #[serde(default = "default_trace_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for TraceExportConfig {
    fn default() -> Self {
        Self {
            endpoint: default_trace_endpoint(),
            service_name: default_service_name(),
            timeout: DEFAULT_TRACE_TIMEOUT,
        }
    }
}

impl TraceExportConfig {
    pub fn validate(&self) -> Result<(), TelemetryError> {
        let url = url::Url::parse(&self.endpoint).map_err(|e| {
            TelemetryError::Config(format!("tracing endpoint '{}': {e}", self.endpoint))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(TelemetryError::Config(format!(
                "tracing endpoint must be http or https: '{}'",
                self.endpoint
            )));
        }
        if self.service_name.trim().is_empty() {
            return Err(TelemetryError::Config(
                "tracing service_name cannot be empty".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(TelemetryError::Config(
                "tracing timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn service_resource(name: &str) -> Resource {
    Resource::new([KeyValue::new("service.name", name.to_string())])
}

/// Build a tracer provider batching spans to the OTLP endpoint.
///
/// Must be called inside a tokio runtime.
pub fn tracer_provider(config: &TraceExportConfig) -> Result<TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(config.endpoint.clone())
        .with_timeout(config.timeout)
        .build()
        .map_err(|e| TelemetryError::Exporter(e.to_string()))?;

    Ok(TracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_resource(service_resource(&config.service_name))
        .build())
}

/// `tracing` layer turning spans into OpenTelemetry spans of `provider`.
pub fn span_layer<S>(provider: &TracerProvider) -> OpenTelemetryLayer<S, Tracer>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME))
}

/// Flush pending spans and stop the tracer provider.
pub fn shutdown_tracer(provider: &TracerProvider) -> Result<(), TelemetryError> {
    provider
        .shutdown()
        .map_err(|e| TelemetryError::Shutdown(e.to_string()))
}

// =============================================================================
// Subscriber
// =============================================================================

/// Install the global `tracing` subscriber.
///
/// When `logstash` is given, every log record is also forwarded to the
/// Logstash shipper. When `traces` is given, spans are exported over OTLP
/// and the returned provider must be shut down before exit.
pub fn init_tracing(
    logstash: Option<LogstashLayer>,
    traces: Option<&TraceExportConfig>,
) -> Result<Option<TracerProvider>, TelemetryError> {
    let provider = traces.map(tracer_provider).transpose()?;
    let otel = provider.as_ref().map(span_layer);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
        .with(tracing_subscriber::fmt::layer())
        .with(logstash)
        .with(otel)
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))?;

    Ok(provider)
}

// =============================================================================
// Metrics
// =============================================================================

/// Meter provider and the registry it exports into.
#[derive(Debug, Clone)]
pub struct MetricsHandles {
    pub provider: SdkMeterProvider,
    pub registry: Registry,
}

impl MetricsHandles {
    /// Flush and stop the meter provider.
    pub fn shutdown(&self) -> Result<(), TelemetryError> {
        self.provider
            .shutdown()
            .map_err(|e| TelemetryError::Shutdown(e.to_string()))
    }
}

/// Build a meter provider reading into a fresh Prometheus registry.
pub fn metrics_provider() -> Result<MetricsHandles, TelemetryError> {
    let registry = Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()
        .map_err(|e| TelemetryError::Exporter(e.to_string()))?;

    let provider = SdkMeterProvider::builder()
        .with_reader(exporter)
        .with_resource(service_resource(SERVICE_NAME))
        .build();

    Ok(MetricsHandles { provider, registry })
}

/// Build the meter provider and install it as the global one.
pub fn init_metrics() -> Result<MetricsHandles, TelemetryError> {
    let handles = metrics_provider()?;
    global::set_meter_provider(handles.provider.clone());
    tracing::debug!(service = SERVICE_NAME, "Meter provider installed");
    Ok(handles)
}
