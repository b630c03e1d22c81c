//! # Process-wide instrumentation
//!
//! [`initialize_instrumentation`] must run before anything else in the
//! process creates spans or emits `tracing` events: it installs the global
//! tracer provider and the global `tracing` subscriber, and neither can be
//! replaced afterwards. Later calls return the already installed
//! [`Instrumentation`] without touching anything.
//!
//! The subscriber has two layers:
//!
//! * an OpenTelemetry log bridge, which turns `tracing` events at INFO and
//!   above into log records correlated with the current span. Events from
//!   OpenTelemetry itself and from HTTP client crates are filtered out so
//!   exporting never feeds back into telemetry. `RUST_LOG` does not apply
//!   here, so the invocation log line is always exported.
//! * a `fmt` layer printing to stdout, filtered by `RUST_LOG`.
use crate::error::InstrumentationError;
use crate::handler::SERVICE_NAME;
use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::InstrumentationScope;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, OnceLock};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Service name reported on the resource.
pub(crate) const OTEL_SERVICE_NAME: &str = "OTEL_SERVICE_NAME";
/// Exporter used for traces and logs: `console`, `otlp` or `none`.
pub(crate) const OTEL_TRACES_EXPORTER: &str = "OTEL_TRACES_EXPORTER";
/// `tracing-subscriber` filter directives for the console output.
pub(crate) const RUST_LOG: &str = "RUST_LOG";
pub(crate) const RUST_LOG_DEFAULT: &str = "info";
const BRIDGE_LEVEL: &str = "info";

// Never bridged into OpenTelemetry logs.
const TELEMETRY_LOOP_DIRECTIVES: &[&str] = &[
    "opentelemetry=off",
    "hyper=off",
    "tonic=off",
    "h2=off",
    "reqwest=off",
];

static INSTRUMENTATION: OnceLock<Instrumentation> = OnceLock::new();
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Where spans and log records are exported.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExporterKind {
    /// Pretty-printed to stdout.
    #[default]
    Stdout,
    /// OTLP over HTTP, configured by the `OTEL_EXPORTER_OTLP_*` variables.
    /// Needs the `otlp` feature.
    Otlp,
    /// Dropped.
    None,
}

impl ExporterKind {
    /// The name used in `OTEL_TRACES_EXPORTER`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExporterKind::Stdout => "console",
            ExporterKind::Otlp => "otlp",
            ExporterKind::None => "none",
        }
    }
}

impl FromStr for ExporterKind {
    type Err = InstrumentationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "console" | "stdout" => Ok(ExporterKind::Stdout),
            "otlp" => Ok(ExporterKind::Otlp),
            "none" => Ok(ExporterKind::None),
            other => Err(InstrumentationError::UnsupportedExporter(other.to_string())),
        }
    }
}

impl fmt::Display for ExporterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings for [`initialize_instrumentation`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstrumentationSettings {
    /// `service.name` of the resource.
    pub service_name: String,
    /// Exporter for spans and log records.
    pub exporter: ExporterKind,
    /// Console log filter directives. Exported log records are not affected.
    pub log_filter: String,
}

impl Default for InstrumentationSettings {
    fn default() -> Self {
        InstrumentationSettings {
            service_name: SERVICE_NAME.to_string(),
            exporter: ExporterKind::default(),
            log_filter: RUST_LOG_DEFAULT.to_string(),
        }
    }
}

impl InstrumentationSettings {
    /// Builds settings from the environment, falling back to defaults for
    /// unset, empty or unrecognized values.
    ///
    /// * `OTEL_SERVICE_NAME`
    /// * `OTEL_TRACES_EXPORTER`
    /// * `RUST_LOG`
    pub fn from_env() -> Self {
        let mut settings = InstrumentationSettings::default();
        if let Some(service_name) = non_empty_var(OTEL_SERVICE_NAME) {
            settings.service_name = service_name;
        }
        if let Some(exporter) = non_empty_var(OTEL_TRACES_EXPORTER).and_then(|v| v.parse().ok()) {
            settings.exporter = exporter;
        }
        if let Some(log_filter) = non_empty_var(RUST_LOG) {
            settings.log_filter = log_filter;
        }
        settings
    }

    /// Sets the service name.
    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }

    /// Sets the exporter.
    pub fn with_exporter(mut self, exporter: ExporterKind) -> Self {
        self.exporter = exporter;
        self
    }

    /// Sets the console log filter.
    pub fn with_log_filter(mut self, log_filter: impl Into<String>) -> Self {
        self.log_filter = log_filter.into();
        self
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Handle to the installed providers. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Instrumentation {
    service_name: String,
    tracer_provider: SdkTracerProvider,
    logger_provider: SdkLoggerProvider,
}

impl Instrumentation {
    /// `service.name` of the installed resource.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// A tracer from the global provider, scoped to this crate.
    pub fn tracer(&self) -> BoxedTracer {
        let scope = InstrumentationScope::builder(env!("CARGO_PKG_NAME"))
            .with_version(env!("CARGO_PKG_VERSION"))
            .build();
        global::tracer_with_scope(scope)
    }

    /// The installed tracer provider.
    pub fn tracer_provider(&self) -> &SdkTracerProvider {
        &self.tracer_provider
    }

    /// The installed logger provider.
    pub fn logger_provider(&self) -> &SdkLoggerProvider {
        &self.logger_provider
    }

    /// Exports everything buffered so far.
    pub fn force_flush(&self) -> Result<(), InstrumentationError> {
        self.tracer_provider.force_flush()?;
        self.logger_provider.force_flush()?;
        Ok(())
    }

    /// Flushes and shuts down both providers. Telemetry produced afterwards
    /// is dropped.
    pub fn shutdown(&self) -> Result<(), InstrumentationError> {
        self.tracer_provider.shutdown()?;
        self.logger_provider.shutdown()?;
        Ok(())
    }
}

/// Installs tracing for the whole process. Call it first in `main`.
///
/// The first call builds the providers, installs the global tracer provider
/// and the global `tracing` subscriber. Every later call returns the same
/// [`Instrumentation`] and ignores `settings`.
pub fn initialize_instrumentation(
    settings: &InstrumentationSettings,
) -> Result<Instrumentation, InstrumentationError> {
    let _lock = INIT_LOCK.lock()?;
    if let Some(existing) = INSTRUMENTATION.get() {
        trigger_debug!(name: "Instrumentation.AlreadyInitialized");
        return Ok(existing.clone());
    }

    let resource = Resource::builder()
        .with_service_name(settings.service_name.clone())
        .build();

    // Nothing global is touched until both providers exist, so a failed
    // call leaves the process as it was.
    let logger_provider = build_logger_provider(settings.exporter, resource.clone())?;
    let tracer_provider = build_tracer_provider(settings.exporter, resource)?;
    install_subscriber(&logger_provider, &settings.log_filter)?;
    global::set_tracer_provider(tracer_provider.clone());

    let instrumentation = Instrumentation {
        service_name: settings.service_name.clone(),
        tracer_provider,
        logger_provider,
    };
    // Cannot be set concurrently while the lock is held.
    let _ = INSTRUMENTATION.set(instrumentation.clone());

    trigger_info!(
        name: "Instrumentation.Initialized",
        service_name = settings.service_name.clone(),
        exporter = settings.exporter.as_str(),
    );
    Ok(instrumentation)
}

/// Whether [`initialize_instrumentation`] has completed in this process.
pub fn is_initialized() -> bool {
    INSTRUMENTATION.get().is_some()
}

fn build_logger_provider(
    exporter: ExporterKind,
    resource: Resource,
) -> Result<SdkLoggerProvider, InstrumentationError> {
    let builder = SdkLoggerProvider::builder().with_resource(resource);
    let provider = match exporter {
        ExporterKind::Stdout => builder
            .with_simple_exporter(opentelemetry_stdout::LogExporter::default())
            .build(),
        ExporterKind::Otlp => {
            #[cfg(feature = "otlp")]
            {
                let exporter = opentelemetry_otlp::LogExporter::builder()
                    .with_http()
                    .build()
                    .map_err(|err| InstrumentationError::Exporter {
                        signal: "logs",
                        reason: err.to_string(),
                    })?;
                builder.with_batch_exporter(exporter).build()
            }
            #[cfg(not(feature = "otlp"))]
            {
                return Err(InstrumentationError::UnsupportedExporter(
                    exporter.to_string(),
                ));
            }
        }
        ExporterKind::None => builder.build(),
    };
    Ok(provider)
}

fn build_tracer_provider(
    exporter: ExporterKind,
    resource: Resource,
) -> Result<SdkTracerProvider, InstrumentationError> {
    let builder = SdkTracerProvider::builder().with_resource(resource);
    let provider = match exporter {
        ExporterKind::Stdout => builder
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build(),
        ExporterKind::Otlp => {
            #[cfg(feature = "otlp")]
            {
                let exporter = opentelemetry_otlp::SpanExporter::builder()
                    .with_http()
                    .build()
                    .map_err(|err| InstrumentationError::Exporter {
                        signal: "traces",
                        reason: err.to_string(),
                    })?;
                builder.with_batch_exporter(exporter).build()
            }
            #[cfg(not(feature = "otlp"))]
            {
                return Err(InstrumentationError::UnsupportedExporter(
                    exporter.to_string(),
                ));
            }
        }
        ExporterKind::None => builder.build(),
    };
    Ok(provider)
}

fn install_subscriber(
    logger_provider: &SdkLoggerProvider,
    log_filter: &str,
) -> Result<(), InstrumentationError> {
    let otel_layer = OpenTelemetryTracingBridge::new(logger_provider).with_filter(bridge_filter()?);
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_thread_names(true)
        .with_filter(parse_filter(log_filter)?);

    tracing_subscriber::registry()
        .with(otel_layer)
        .with(fmt_layer)
        .try_init()
        .map_err(|err| InstrumentationError::Subscriber(err.to_string()))
}

fn parse_filter(directives: &str) -> Result<EnvFilter, InstrumentationError> {
    EnvFilter::try_new(directives).map_err(|err| InstrumentationError::Subscriber(err.to_string()))
}

fn bridge_filter() -> Result<EnvFilter, InstrumentationError> {
    let mut filter = parse_filter(BRIDGE_LEVEL)?;
    for directive in TELEMETRY_LOOP_DIRECTIVES {
        let directive = directive
            .parse()
            .map_err(|err| InstrumentationError::Subscriber(format!("{err}")))?;
        filter = filter.add_directive(directive);
    }
    Ok(filter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("console", ExporterKind::Stdout)]
    #[case("stdout", ExporterKind::Stdout)]
    #[case(" OTLP ", ExporterKind::Otlp)]
    #[case("none", ExporterKind::None)]
    fn parses_exporter_names(#[case] name: &str, #[case] expected: ExporterKind) {
        assert_eq!(name.parse::<ExporterKind>().unwrap(), expected);
    }

    #[test]
    fn rejects_unknown_exporter() {
        let err = "zipkin".parse::<ExporterKind>().unwrap_err();
        assert!(matches!(err, InstrumentationError::UnsupportedExporter(name) if name == "zipkin"));
    }

    #[test]
    fn settings_default_when_env_is_unset() {
        temp_env::with_vars_unset([OTEL_SERVICE_NAME, OTEL_TRACES_EXPORTER, RUST_LOG], || {
            assert_eq!(
                InstrumentationSettings::from_env(),
                InstrumentationSettings::default()
            );
        });
    }

    #[test]
    fn settings_from_env() {
        temp_env::with_vars(
            [
                (OTEL_SERVICE_NAME, Some("billing-timers")),
                (OTEL_TRACES_EXPORTER, Some("none")),
                (RUST_LOG, Some("debug")),
            ],
            || {
                let settings = InstrumentationSettings::from_env();
                assert_eq!(settings.service_name, "billing-timers");
                assert_eq!(settings.exporter, ExporterKind::None);
                assert_eq!(settings.log_filter, "debug");
            },
        );
    }

    #[test]
    fn settings_ignore_invalid_env_values() {
        temp_env::with_vars(
            [
                (OTEL_SERVICE_NAME, Some("  ")),
                (OTEL_TRACES_EXPORTER, Some("carrier-pigeon")),
            ],
            || {
                let settings = InstrumentationSettings::from_env();
                assert_eq!(settings.service_name, SERVICE_NAME);
                assert_eq!(settings.exporter, ExporterKind::Stdout);
            },
        );
    }

    #[test]
    fn bridge_filter_drops_telemetry_crates() {
        let filter = bridge_filter().unwrap().to_string();
        for directive in TELEMETRY_LOOP_DIRECTIVES {
            assert!(filter.contains(directive), "{filter} lacks {directive}");
        }
        assert!(parse_filter("app=loud").is_err());
    }

    #[cfg(not(feature = "otlp"))]
    #[test]
    fn otlp_requires_feature() {
        let err = build_tracer_provider(ExporterKind::Otlp, Resource::builder().build()).unwrap_err();
        assert!(matches!(err, InstrumentationError::UnsupportedExporter(name) if name == "otlp"));
    }

    #[test]
    fn quiet_console_still_exports_invocation_logs() {
        use crate::{InstrumentedHandler, InvocationContext, TimerInfo, RESOURCE_NAME};
        use opentelemetry::trace::TracerProvider as _;
        use opentelemetry_sdk::logs::InMemoryLogExporter;

        let logs = InMemoryLogExporter::default();
        let logger_provider = SdkLoggerProvider::builder()
            .with_simple_exporter(logs.clone())
            .build();
        let tracer_provider = SdkTracerProvider::builder().build();
        let subscriber = tracing_subscriber::registry()
            .with(OpenTelemetryTracingBridge::new(&logger_provider).with_filter(bridge_filter().unwrap()))
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_filter(parse_filter("warn").unwrap()),
            );

        let handler = InstrumentedHandler::timer_trigger(tracer_provider.tracer("instrumentation-test"));
        let timer = TimerInfo::new("*/1 * * * * *".parse().unwrap());
        tracing::subscriber::with_default(subscriber, || {
            for _ in 0..2 {
                let context = InvocationContext::new(RESOURCE_NAME, "myTimer");
                handler.handle(&timer, &context).unwrap();
            }
        });

        assert_eq!(logs.get_emitted_logs().unwrap().len(), 2);
    }
}
