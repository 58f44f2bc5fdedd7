use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "beach-pier";

/// Installs the global Prometheus recorder. Only the server needs one.
pub fn install_metrics_recorder() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus metrics recorder")
}

/// Process-wide logging and tracing setup. Dropping it flushes spans.
pub struct Telemetry {
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init() -> Result<Self> {
        let registry = tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(tracing_subscriber::fmt::layer().with_target(false));

        let tracer_provider = if env_truthy("BEACH_PIER_OTEL_STDOUT") {
            let provider = SdkTracerProvider::builder()
                .with_simple_exporter(SpanExporter::default())
                .with_sampler(Sampler::AlwaysOn)
                .with_resource(
                    Resource::builder()
                        .with_attributes(vec![KeyValue::new("service.name", SERVICE_NAME)])
                        .build(),
                )
                .build();
            global::set_tracer_provider(provider.clone());
            registry
                .with(tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME)))
                .try_init()
                .context("failed to initialise tracing subscriber")?;
            info!("OpenTelemetry stdout exporter enabled (BEACH_PIER_OTEL_STDOUT=1)");
            Some(provider)
        } else {
            registry
                .try_init()
                .context("failed to initialise tracing subscriber")?;
            None
        };

        Ok(Self { tracer_provider })
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = &self.tracer_provider {
            if let Err(err) = provider.shutdown() {
                warn!(error = %err, "failed to shutdown OpenTelemetry tracer provider");
            }
        }
    }
}

fn env_truthy(key: &str) -> bool {
    std::env::var(key)
        .map(|val| matches!(val.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}
