//! Logging and tracing for the `vigil` binary.
//!
//! Logs go to stderr so the report on stdout stays machine readable.
//! `LOG_LEVEL` takes an `EnvFilter` directive, `LOG_FORMAT=json` switches to
//! JSON lines, and spans are exported over OTLP when
//! `OTEL_EXPORTER_OTLP_ENDPOINT` is set.

use std::env;
use std::io;

use opentelemetry::KeyValue;
use opentelemetry::TraceId;
use opentelemetry::trace::{TraceContextExt as _, TracerProvider as _};
use opentelemetry_otlp::SpanExporter;
use opentelemetry_resource_detectors::{K8sResourceDetector, ProcessResourceDetector};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_opentelemetry::{OpenTelemetryLayer, OpenTelemetrySpanExt as _};
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "info";

/// Handle on the installed exporters; flush it before the process exits
#[derive(Debug, Default)]
#[must_use]
pub struct Telemetry {
    provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    /// Flushes pending spans and stops the exporter.
    ///
    /// # Errors
    ///
    /// Returns `Err` when the exporter fails to flush.
    pub fn shutdown(self) -> anyhow::Result<()> {
        if let Some(provider) = self.provider {
            provider.shutdown()?;
        }
        Ok(())
    }
}

/// Hex trace id of the current span, when spans are exported
#[must_use]
pub fn current_trace_id() -> Option<String> {
    let id = tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id();
    (id != TraceId::INVALID).then(|| id.to_string())
}

fn resource() -> Resource {
    Resource::builder()
        .with_detector(Box::new(K8sResourceDetector))
        .with_detector(Box::new(ProcessResourceDetector))
        .with_service_name(env!("CARGO_PKG_NAME"))
        .with_attribute(KeyValue::new("service.version", env!("CARGO_PKG_VERSION")))
        .build()
}

fn init_provider() -> anyhow::Result<SdkTracerProvider> {
    let exporter = SpanExporter::builder().with_tonic().build()?;

    Ok(SdkTracerProvider::builder()
        .with_resource(resource())
        .with_batch_exporter(exporter)
        .build())
}

fn is_otel_enabled() -> bool {
    env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok_and(|v| !v.is_empty())
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Returns `Err` when the exporter cannot be built or a subscriber is already
/// installed.
pub fn init() -> anyhow::Result<Telemetry> {
    let logger = if env::var("LOG_FORMAT").is_ok_and(|v| v == "json") {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_writer(io::stderr).boxed()
    };

    let env_filter =
        EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let reg = Registry::default().with(env_filter).with(logger);

    if is_otel_enabled() {
        let provider = init_provider()?;
        let otel = OpenTelemetryLayer::new(provider.tracer(env!("CARGO_PKG_NAME")));
        reg.with(otel).try_init()?;
        Ok(Telemetry {
            provider: Some(provider),
        })
    } else {
        reg.try_init()?;
        Ok(Telemetry::default())
    }
}
