//! Tracing subscriber setup.
//!
//! Log output is a compact or JSON fmt layer per the configured
//! [`LogFormat`]. When `OTEL_EXPORTER_OTLP_ENDPOINT` is set, spans are also
//! exported over OTLP, tagged with the synthetic node's name so traces from
//! several bridges can share one collector.

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{prelude::*, EnvFilter, Layer, Registry};

use crate::settings::LogFormat;

/// Install the global subscriber. `node_name` identifies this bridge in
/// exported spans. Fails if a subscriber is already installed or the OTLP
/// exporter cannot be built.
pub fn init(log_format: LogFormat, node_name: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(fmt_layer(log_format).with_filter(filter));

    match std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        Ok(endpoint) => registry.with(otlp_layer(&endpoint, node_name)?).try_init()?,
        Err(_) => registry.try_init()?,
    }
    Ok(())
}

/// Install a plain text subscriber for tests. Safe to call from every test;
/// only the first call wins.
pub fn init_for_tests() {
    let _ = init(LogFormat::Text, "test");
}

fn fmt_layer(log_format: LogFormat) -> Box<dyn Layer<Registry> + Send + Sync> {
    let layer = tracing_subscriber::fmt::layer().with_target(true);
    match log_format {
        LogFormat::Text => layer.compact().boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

fn otlp_layer<S>(
    endpoint: &str,
    node_name: &str,
) -> anyhow::Result<tracing_opentelemetry::OpenTelemetryLayer<S, sdktrace::Tracer>>
where
    S: tracing::Subscriber + for<'span> LookupSpan<'span>,
{
    let resource = Resource::new(vec![
        KeyValue::new("service.name", "trestle"),
        KeyValue::new("service.instance.id", node_name.to_string()),
    ]);
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .http()
                .with_endpoint(endpoint),
        )
        .with_trace_config(sdktrace::Config::default().with_resource(resource))
        .install_batch(runtime::Tokio)?;
    Ok(tracing_opentelemetry::layer().with_tracer(tracer))
}

/// Flush the OTLP exporter if one was configured.
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}
