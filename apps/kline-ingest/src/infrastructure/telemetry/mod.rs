//! Logging and OpenTelemetry Tracing
//!
//! One global `tracing` subscriber per process. Each run mode writes its own
//! daily-rotated file next to stdout (`kline-ingest-backfill.log`,
//! `kline-ingest-runtime.log`), and spans can be exported over OTLP.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Filter directives (default: `kline_ingest=info`)
//! - `OTEL_ENABLED`: `true` or `1` to export spans (default: off)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: Collector address (default: http://localhost:4317)
//! - `OTEL_SERVICE_NAME`: Service name on exported spans (default: kline-ingest)

use std::path::{Path, PathBuf};

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::application::services::RunMode;

const SERVICE_NAME: &str = "kline-ingest";
const OTLP_ENDPOINT: &str = "http://localhost:4317";
const FALLBACK_FILTER: &str = "kline_ingest=info,sqlx=warn,hyper=warn,h2=warn";

/// Rotated log file destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    /// Directory holding the rotated files.
    pub dir: PathBuf,
    /// File name prefix; the appender adds the date.
    pub file_name: String,
}

/// Telemetry settings.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Export spans over OTLP.
    pub otlp_enabled: bool,
    /// Collector endpoint.
    pub otlp_endpoint: String,
    /// `service.name` resource attribute.
    pub service_name: String,
    /// Run mode recorded as the `ingest.mode` resource attribute.
    pub mode: Option<RunMode>,
    /// Rotated file output.
    pub log_file: Option<LogFile>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            otlp_enabled: false,
            otlp_endpoint: OTLP_ENDPOINT.to_string(),
            service_name: SERVICE_NAME.to_string(),
            mode: None,
            log_file: None,
        }
    }
}

impl TelemetryConfig {
    /// Read the `OTEL_*` variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup` instead of the process environment.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            otlp_enabled: lookup("OTEL_ENABLED")
                .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true")),
            otlp_endpoint: lookup("OTEL_EXPORTER_OTLP_ENDPOINT").unwrap_or(defaults.otlp_endpoint),
            service_name: lookup("OTEL_SERVICE_NAME").unwrap_or(defaults.service_name),
            ..defaults
        }
    }

    /// Tag output with `mode` and log to `kline-ingest-<mode>.log` under `log_dir`.
    #[must_use]
    pub fn for_mode(mut self, mode: RunMode, log_dir: &Path) -> Self {
        self.mode = Some(mode);
        self.log_file = Some(LogFile {
            dir: log_dir.to_path_buf(),
            file_name: format!("{SERVICE_NAME}-{mode}.log"),
        });
        self
    }

    fn resource(&self) -> Resource {
        let mut builder = Resource::builder().with_service_name(self.service_name.clone());
        if let Some(mode) = self.mode {
            builder = builder.with_attribute(KeyValue::new("ingest.mode", mode.as_str()));
        }
        builder.build()
    }
}

/// Keeps the file writer and the span exporter alive.
///
/// Dropping it flushes buffered log lines and pending spans.
pub struct TelemetryGuard {
    tracer_provider: Option<SdkTracerProvider>,
    _file_writer: Option<WorkerGuard>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("OpenTelemetry shutdown failed: {e}");
        }
    }
}

/// Install the global subscriber.
///
/// An OTLP exporter that cannot be built is reported on stderr and skipped.
#[must_use]
pub fn init(config: &TelemetryConfig) -> TelemetryGuard {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(FALLBACK_FILTER));

    let stdout = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);

    let (file, file_writer) = config
        .log_file
        .as_ref()
        .map(|log| {
            let (writer, guard) = tracing_appender::non_blocking(
                tracing_appender::rolling::daily(&log.dir, &log.file_name),
            );
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (layer, guard)
        })
        .unzip();

    let tracer_provider = config.otlp_enabled.then(|| span_exporter(config)).flatten();
    let otel = tracer_provider.as_ref().map(|provider| {
        tracing_opentelemetry::layer().with_tracer(provider.tracer(config.service_name.clone()))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout)
        .with(file)
        .with(otel)
        .init();

    TelemetryGuard {
        tracer_provider,
        _file_writer: file_writer,
    }
}

fn span_exporter(config: &TelemetryConfig) -> Option<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.otlp_endpoint)
        .build()
        .inspect_err(|e| eprintln!("OTLP exporter unavailable, spans stay local: {e}"))
        .ok()?;

    Some(
        SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(config.resource())
            .build(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| (*v).to_string())
        }
    }

    #[test]
    fn export_is_off_without_variables() {
        let config = TelemetryConfig::from_lookup(lookup(&[]));
        assert!(!config.otlp_enabled);
        assert_eq!(config.otlp_endpoint, OTLP_ENDPOINT);
        assert_eq!(config.service_name, SERVICE_NAME);
        assert!(config.mode.is_none());
    }

    #[test]
    fn export_accepts_true_or_one() {
        assert!(TelemetryConfig::from_lookup(lookup(&[("OTEL_ENABLED", "TRUE")])).otlp_enabled);
        assert!(TelemetryConfig::from_lookup(lookup(&[("OTEL_ENABLED", "1")])).otlp_enabled);
        assert!(!TelemetryConfig::from_lookup(lookup(&[("OTEL_ENABLED", "no")])).otlp_enabled);
    }

    #[test]
    fn overrides_are_read() {
        let config = TelemetryConfig::from_lookup(lookup(&[
            ("OTEL_EXPORTER_OTLP_ENDPOINT", "http://collector:4317"),
            ("OTEL_SERVICE_NAME", "kline-ingest-eu"),
        ]));
        assert_eq!(config.otlp_endpoint, "http://collector:4317");
        assert_eq!(config.service_name, "kline-ingest-eu");
    }

    #[test]
    fn each_mode_gets_its_own_log_file() {
        let backfill = TelemetryConfig::default().for_mode(RunMode::Backfill, Path::new("logs"));
        let runtime = TelemetryConfig::default().for_mode(RunMode::Runtime, Path::new("logs"));

        assert_eq!(backfill.mode, Some(RunMode::Backfill));
        assert_eq!(
            backfill.log_file,
            Some(LogFile {
                dir: PathBuf::from("logs"),
                file_name: "kline-ingest-backfill.log".to_string(),
            })
        );
        assert_eq!(
            runtime.log_file.map(|log| log.file_name).as_deref(),
            Some("kline-ingest-runtime.log")
        );
    }
}
