//! Log output and optional OTLP trace export.

use anyhow::Result;
use opentelemetry::{KeyValue, global, trace::TracerProvider as _};
use opentelemetry_otlp::{Compression, WithExportConfig, WithTonicConfig};
use opentelemetry_sdk::{Resource, propagation::TraceContextPropagator, trace::SdkTracerProvider};
use std::{env, sync::OnceLock, time::Duration};
use tracing::{Level, debug};
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt};
use ulid::Ulid;

const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
const EXPORT_TIMEOUT: Duration = Duration::from_secs(3);

static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Collector address from the environment. A bare `host:port` is taken as plain HTTP.
fn otlp_endpoint() -> Option<String> {
    let endpoint = env::var(OTLP_ENDPOINT_ENV).ok()?;
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.is_empty() {
        None
    } else if endpoint.contains("://") {
        Some(endpoint.to_string())
    } else {
        Some(format!("http://{endpoint}"))
    }
}

fn resource() -> Resource {
    let instance_id =
        env::var("OTEL_SERVICE_INSTANCE_ID").unwrap_or_else(|_| Ulid::new().to_string());
    Resource::builder_empty()
        .with_attributes([
            KeyValue::new("service.name", env!("CARGO_PKG_NAME")),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            KeyValue::new("service.instance.id", instance_id),
            KeyValue::new("vcs.commit", crate::GIT_COMMIT_HASH),
        ])
        .build()
}

fn tracer_provider(endpoint: &str) -> Result<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .with_compression(Compression::Gzip)
        .with_timeout(EXPORT_TIMEOUT)
        .build()?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource())
        .build())
}

fn env_filter(level: Level) -> Result<EnvFilter> {
    Ok(EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy()
        .add_directive("hyper=error".parse()?)
        .add_directive("sqlx=warn".parse()?)
        .add_directive("opentelemetry_sdk=warn".parse()?))
}

/// Install the global subscriber. Traces are exported only when
/// `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
///
/// # Errors
///
/// Returns an error if the exporter or subscriber cannot be set up
pub fn init(verbosity_level: Option<Level>) -> Result<()> {
    let filter = env_filter(verbosity_level.unwrap_or(Level::ERROR))?;
    let fmt_layer = fmt::layer().compact().with_target(false);

    let Some(endpoint) = otlp_endpoint() else {
        tracing::subscriber::set_global_default(Registry::default().with(fmt_layer).with(filter))?;
        return Ok(());
    };

    let provider = tracer_provider(&endpoint)?;
    let tracer = provider.tracer(env!("CARGO_PKG_NAME"));
    global::set_tracer_provider(provider.clone());
    global::set_text_map_propagator(TraceContextPropagator::new());
    let _ = TRACER_PROVIDER.set(provider);

    tracing::subscriber::set_global_default(
        Registry::default()
            .with(fmt_layer)
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .with(filter),
    )?;
    debug!("exporting traces to {endpoint}");
    Ok(())
}

/// Flush pending spans. Does nothing when export was never enabled.
pub fn shutdown_tracer() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        let _ = provider.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_unset_or_blank_disables_export() {
        temp_env::with_var(OTLP_ENDPOINT_ENV, None::<&str>, || {
            assert_eq!(otlp_endpoint(), None);
        });
        temp_env::with_var(OTLP_ENDPOINT_ENV, Some("  "), || {
            assert_eq!(otlp_endpoint(), None);
        });
    }

    #[test]
    fn endpoint_keeps_scheme_and_defaults_to_http() {
        temp_env::with_var(OTLP_ENDPOINT_ENV, Some("https://collector:4317/"), || {
            assert_eq!(otlp_endpoint().as_deref(), Some("https://collector:4317"));
        });
        temp_env::with_var(OTLP_ENDPOINT_ENV, Some("collector:4317"), || {
            assert_eq!(otlp_endpoint().as_deref(), Some("http://collector:4317"));
        });
    }
}
