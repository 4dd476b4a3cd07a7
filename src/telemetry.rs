//! Logging, metrics export and trace export.
//!
//! - `tracing` with an `EnvFilter` (`RUST_LOG` wins over `telemetry.log_level`)
//! - Prometheus scrape endpoint (`prometheus` feature)
//! - OTLP span export (`otel` feature)

#[cfg(feature = "prometheus")]
use std::net::SocketAddr;
#[cfg(any(feature = "prometheus", feature = "otel"))]
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::TelemetryConfig;

#[cfg(feature = "otel")]
use std::sync::OnceLock;
#[cfg(feature = "otel")]
static TRACER_PROVIDER: OnceLock<opentelemetry_sdk::trace::SdkTracerProvider> = OnceLock::new();

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Install the global subscriber and, if configured, the exporters.
pub fn init(config: &TelemetryConfig) -> Result<(), BoxError> {
    init_tracing(config)?;

    #[cfg(feature = "prometheus")]
    if let Some(addr) = config.prometheus_addr {
        start_prometheus_exporter(addr)?;
    }

    Ok(())
}

fn env_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level))
}

fn init_tracing(config: &TelemetryConfig) -> Result<(), BoxError> {
    let filter = env_filter(&config.log_level);

    #[cfg(feature = "otel")]
    if let Some(ref otel) = config.opentelemetry {
        use opentelemetry::trace::TracerProvider;
        use opentelemetry::KeyValue;
        use opentelemetry_otlp::WithExportConfig;
        use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};

        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(&otel.endpoint)
            .build()?;

        let resource = opentelemetry_sdk::Resource::builder()
            .with_attributes([
                KeyValue::new(SERVICE_NAME, otel.service_name.clone()),
                KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
            ])
            .build();

        let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(resource)
            .build();
        let tracer = provider.tracer("dnsroute");
        let _ = TRACER_PROVIDER.set(provider);

        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init()?;

        info!(endpoint = %otel.endpoint, "OpenTelemetry tracing enabled");
        return Ok(());
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

#[cfg(feature = "prometheus")]
fn start_prometheus_exporter(addr: SocketAddr) -> Result<(), BoxError> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    PrometheusBuilder::new().with_http_listener(addr).install()?;
    info!(%addr, "Prometheus metrics exporter started");
    Ok(())
}

/// Flush pending spans.
pub fn shutdown() {
    #[cfg(feature = "otel")]
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            tracing::warn!("Error shutting down tracer provider: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails_instead_of_panicking() {
        let config = TelemetryConfig::default();
        let _ = init(&config);
        assert!(init(&config).is_err());
    }
}
