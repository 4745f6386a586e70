//! Observability utilities.
//!
//! Logs always go to stderr: a plugin process's stdout carries the handshake
//! line and nothing else.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

use crate::process::env::TracingEnv;
use crate::types::ObservabilityConfig;

/// Env var switching log output to JSON.
pub const LOG_FORMAT_ENV: &str = "RELAY_LOOP_LOG_FORMAT";

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Initialize tracing subscriber once for the process.
///
/// Log format defaults to compact text and can be switched to JSON via
/// `RELAY_LOOP_LOG_FORMAT=json`. Filter defaults to `info` if `RUST_LOG` is unset.
pub fn init_tracing() {
    init_tracing_with(&ObservabilityConfig::default(), None);
}

/// Like [`init_tracing`], with the level and format taken from `config`
/// unless `RUST_LOG` / `RELAY_LOOP_LOG_FORMAT` say otherwise. With the `otel`
/// feature, an enabled `export` also installs an OpenTelemetry layer.
pub fn init_tracing_with(config: &ObservabilityConfig, export: Option<&TracingEnv>) {
    TRACING_INIT.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
        let json = std::env::var(LOG_FORMAT_ENV)
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(config.json_logs);

        let subscriber = tracing_subscriber::registry();
        #[cfg(feature = "otel")]
        let subscriber = subscriber.with(export.filter(|t| t.enabled).map(otel::layer));

        let fmt_layer = if json {
            fmt::layer().json().with_writer(std::io::stderr).boxed()
        } else {
            fmt::layer().compact().with_writer(std::io::stderr).boxed()
        };

        if let Err(err) = subscriber.with(fmt_layer).with(env_filter).try_init() {
            eprintln!("tracing init skipped: {err}");
            return;
        }

        #[cfg(not(feature = "otel"))]
        warn_export_unsupported(export);
    });
}

#[cfg(not(feature = "otel"))]
fn warn_export_unsupported(export: Option<&TracingEnv>) {
    if export.is_some_and(|t| t.enabled) {
        tracing::warn!("trace export requested but this build has no otel support");
    }
}

#[cfg(feature = "otel")]
mod otel {
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
    use opentelemetry_sdk::Resource;
    use tracing_subscriber::{Layer, Registry};

    use crate::process::env::TracingEnv;

    pub(super) fn layer(export: &TracingEnv) -> Box<dyn Layer<Registry> + Send + Sync> {
        let attributes = export
            .attributes
            .iter()
            .map(|(k, v)| KeyValue::new(k.clone(), v.clone()));
        let resource = Resource::builder()
            .with_service_name("relay-loop-plugin")
            .with_attributes(attributes)
            .build();
        let provider = SdkTracerProvider::builder()
            .with_sampler(Sampler::TraceIdRatioBased(export.sampling_ratio))
            .with_resource(resource)
            .build();
        let tracer = provider.tracer("relay-loop");
        opentelemetry::global::set_tracer_provider(provider);
        tracing_opentelemetry::layer().with_tracer(tracer).boxed()
    }
}
