//! Process-wide tracing setup.
//!
//! Level resolution mirrors the hosting platform's conventions: an explicit
//! `LOG_LEVEL` wins, otherwise `DEBUG`/`AF_DEBUG` select debug, otherwise info.
//!
//! With `ENABLE_OTEL` on a developer machine, log events are also exported
//! over OTLP to the local collector. Hosted deployments export through the
//! platform instead.

use crate::config::LoggingConfig;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// OTLP (gRPC) endpoint of the local tracing collector.
pub const LOCAL_OTLP_ENDPOINT: &str = "http://localhost:4319";

/// Targets whose events are never exported, so the exporter's own
/// transport logging can't feed back into itself.
const EXPORT_EXCLUDED_TARGETS: &[&str] = &[
    "opentelemetry",
    "tonic",
    "h2",
    "hyper",
    "tower",
    "reqwest",
];

/// Map a level name to a filter. Accepts the Python-style aliases the
/// platform documents (`warning`, `critical`, `fatal`).
pub fn parse_level(name: &str) -> Option<LevelFilter> {
    match name.trim().to_lowercase().as_str() {
        "trace" => Some(LevelFilter::TRACE),
        "debug" => Some(LevelFilter::DEBUG),
        "info" => Some(LevelFilter::INFO),
        "warn" | "warning" => Some(LevelFilter::WARN),
        "error" | "critical" | "fatal" => Some(LevelFilter::ERROR),
        "off" => Some(LevelFilter::OFF),
        _ => None,
    }
}

/// Resolve the effective level from config, with `verbose` forcing debug.
pub fn resolve_level(config: &LoggingConfig, verbose: bool) -> LevelFilter {
    if verbose {
        return LevelFilter::DEBUG;
    }
    if let Some(level) = config.level.as_deref().and_then(parse_level) {
        return level;
    }
    if config.debug || config.af_debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    }
}

/// Where to export telemetry, if anywhere: only when enabled and not
/// running under a managed identity.
pub fn otlp_endpoint(enable_otel: bool, has_msi: bool) -> Option<&'static str> {
    (enable_otel && !has_msi).then_some(LOCAL_OTLP_ENDPOINT)
}

fn exported(target: &str) -> bool {
    !EXPORT_EXCLUDED_TARGETS
        .iter()
        .any(|excluded| target.starts_with(excluded))
}

/// Keeps the OTLP pipeline alive. Pending records are flushed on drop.
#[derive(Default)]
pub struct TelemetryGuard {
    #[cfg(feature = "otel")]
    provider: Option<opentelemetry_sdk::logs::SdkLoggerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        #[cfg(feature = "otel")]
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.shutdown() {
                tracing::warn!(error = %e, "OTLP exporter shutdown failed");
            }
        }
    }
}

#[cfg(feature = "otel")]
fn otlp_provider(
    endpoint: &str,
) -> Result<opentelemetry_sdk::logs::SdkLoggerProvider, Box<dyn std::error::Error + Send + Sync>> {
    use opentelemetry_otlp::{LogExporter, WithExportConfig};
    use opentelemetry_sdk::logs::SdkLoggerProvider;
    use opentelemetry_sdk::Resource;

    let exporter = LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    Ok(SdkLoggerProvider::builder()
        .with_resource(
            Resource::builder()
                .with_service_name(env!("CARGO_PKG_NAME"))
                .build(),
        )
        .with_batch_exporter(exporter)
        .build())
}

/// Install the global subscriber. `RUST_LOG` directives, if present, refine
/// the resolved default. When `otlp_endpoint` is set, events are also
/// exported there; if the exporter can't be built, a warning is logged and
/// console logging carries on alone.
///
/// Must be called inside a Tokio runtime when exporting.
pub fn init(level: LevelFilter, otlp_endpoint: Option<&str>) -> TelemetryGuard {
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false);

    let mut guard = TelemetryGuard::default();
    let mut setup_error = None;

    #[cfg(feature = "otel")]
    let otel_layer = match otlp_endpoint.map(otlp_provider) {
        Some(Ok(provider)) => {
            let layer = opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(
                &provider,
            )
            .with_filter(tracing_subscriber::filter::filter_fn(|meta| {
                exported(meta.target())
            }));
            guard.provider = Some(provider);
            Some(layer)
        }
        Some(Err(e)) => {
            setup_error = Some(e.to_string());
            None
        }
        None => None,
    };
    #[cfg(not(feature = "otel"))]
    let otel_layer: Option<tracing_subscriber::layer::Identity> = {
        if otlp_endpoint.is_some() {
            setup_error = Some("built without the `otel` feature".to_string());
        }
        None
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init();

    if let Some(endpoint) = otlp_endpoint {
        match setup_error {
            Some(error) => tracing::warn!(endpoint, %error, "OTLP export disabled"),
            None => tracing::debug!(endpoint, "exporting telemetry over OTLP"),
        }
    }
    guard
}
