//! Installs the tracing subscribers of a webhook binary: console output,
//! rolling JSON files and OpenTelemetry OTLP trace export.
//!
//! Every subscriber has its own level filter, read from an environment
//! variable and falling back to `INFO`:
//!
//! - [`Tracing::CONSOLE_LOG_LEVEL`]
//! - [`Tracing::FILE_LOG_LEVEL`]
//! - [`Tracing::OTEL_TRACE_EXPORTER_LEVEL`]
use std::path::Path;

use opentelemetry::{global, trace::TracerProvider as _};
use opentelemetry_otlp::SpanExporter;
use opentelemetry_sdk::{
    Resource, propagation::TraceContextPropagator, trace::SdkTracerProvider,
};
use snafu::{ResultExt as _, Snafu};
use tracing::{level_filters::LevelFilter, subscriber::SetGlobalDefaultError};
use tracing_appender::rolling::{InitError, RollingFileAppender};
use tracing_subscriber::{EnvFilter, Layer, Registry, filter::Directive, layer::SubscriberExt};

pub use crate::tracing::options::{LogFormat, RotationPeriod, TelemetryOptions};

mod options;

type Result<T, E = Error> = std::result::Result<T, E>;
type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to build OTLP span exporter"))]
    BuildSpanExporter {
        source: opentelemetry_otlp::ExporterBuildError,
    },

    #[snafu(display("failed to open log file in {directory:?}"))]
    OpenLogFile {
        source: InitError,
        directory: std::path::PathBuf,
    },

    #[snafu(display("failed to parse filter directive {directive:?}"))]
    ParseDirective {
        source: tracing_subscriber::filter::ParseError,
        directive: &'static str,
    },

    #[snafu(display("failed to install the global subscriber"))]
    InstallSubscriber { source: SetGlobalDefaultError },
}

/// Guard of the installed subscribers.
///
/// Spans still buffered by the OTLP exporter are flushed when the guard
/// returned by [`Tracing::init`] is dropped, so bind it to a named variable:
///
/// ```no_run
/// use gatehouse_telemetry::{TelemetryOptions, Tracing};
///
/// # fn main() -> Result<(), gatehouse_telemetry::tracing::Error> {
/// let _tracing_guard = Tracing::pre_configured("gatehouse", TelemetryOptions::default()).init()?;
/// tracing::info!("subscribers installed");
/// # Ok(())
/// # }
/// ```
pub struct Tracing {
    service_name: &'static str,
    options: TelemetryOptions,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Tracing {
    pub const CONSOLE_LOG_LEVEL: &str = "CONSOLE_LOG_LEVEL";
    pub const FILE_LOG_LEVEL: &str = "FILE_LOG_LEVEL";
    pub const FILE_LOG_SUFFIX: &str = "tracing-rs.json";
    pub const OTEL_TRACE_EXPORTER_LEVEL: &str = "OTEL_TRACE_EXPORTER_LEVEL";

    /// Prepares the subscribers selected by `options`. Nothing is installed
    /// before [`Tracing::init`] is called.
    pub fn pre_configured(service_name: &'static str, options: TelemetryOptions) -> Self {
        Self {
            service_name,
            options,
            tracer_provider: None,
        }
    }

    /// Installs the subscribers as global default. Does nothing if all of
    /// them are disabled.
    pub fn init(mut self) -> Result<Self> {
        let mut layers: Vec<BoxedLayer> = Vec::new();

        if !self.options.console_log_disabled {
            layers.push(console_layer(self.options.console_log_format));
        }

        if let Some(directory) = &self.options.file_log_directory {
            layers.push(self.file_layer(directory)?);
        }

        if self.options.otel_trace_exporter_enabled {
            let (layer, tracer_provider) = otlp_layer(self.service_name)?;
            layers.push(layer);
            self.tracer_provider = Some(tracer_provider);

            // Incoming `traceparent` headers become the parents of request spans
            global::set_text_map_propagator(TraceContextPropagator::new());
        }

        if !layers.is_empty() {
            tracing::subscriber::set_global_default(tracing_subscriber::registry().with(layers))
                .context(InstallSubscriberSnafu)?;
        }

        Ok(self)
    }

    fn file_layer(&self, directory: &Path) -> Result<BoxedLayer> {
        let mut appender = RollingFileAppender::builder()
            .rotation(self.options.file_log_rotation_period.unwrap_or_default().into())
            .filename_prefix(self.service_name)
            .filename_suffix(Self::FILE_LOG_SUFFIX);
        if let Some(max_files) = self.options.file_log_max_files {
            appender = appender.max_log_files(max_files);
        }
        let appender = appender.build(directory).context(OpenLogFileSnafu {
            directory: directory.to_path_buf(),
        })?;

        Ok(tracing_subscriber::fmt::layer()
            .json()
            .with_writer(appender)
            .with_filter(env_filter(Self::FILE_LOG_LEVEL))
            .boxed())
    }
}

impl Drop for Tracing {
    fn drop(&mut self) {
        if let Some(tracer_provider) = self.tracer_provider.take() {
            tracing::debug!("flushing OTLP span exporter");
            if let Err(error) = tracer_provider.shutdown() {
                tracing::error!(%error, "failed to shut down OTLP tracer provider");
            }
        }
    }
}

fn console_layer(format: LogFormat) -> BoxedLayer {
    let filter = env_filter(Tracing::CONSOLE_LOG_LEVEL);
    match format {
        LogFormat::Plain => tracing_subscriber::fmt::layer().with_filter(filter).boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_filter(filter)
            .boxed(),
    }
}

fn otlp_layer(service_name: &'static str) -> Result<(BoxedLayer, SdkTracerProvider)> {
    // Spans of the exporter's own HTTP/2 client would be exported again
    let directive = "h2=off";
    let filter = env_filter(Tracing::OTEL_TRACE_EXPORTER_LEVEL)
        .add_directive(directive.parse().context(ParseDirectiveSnafu { directive })?);

    let exporter = SpanExporter::builder()
        .with_tonic()
        .build()
        .context(BuildSpanExporterSnafu)?;
    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(Resource::builder().with_service_name(service_name).build())
        .build();

    let layer = tracing_opentelemetry::layer()
        .with_tracer(tracer_provider.tracer(service_name))
        .with_filter(filter)
        .boxed();
    Ok((layer, tracer_provider))
}

/// A filter read from `variable`, defaulting to `INFO` if it is unset or
/// invalid.
fn env_filter(variable: &str) -> EnvFilter {
    EnvFilter::builder()
        .with_env_var(variable)
        .with_default_directive(Directive::from(LevelFilter::INFO))
        .from_env_lossy()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_variable_defaults_to_info() {
        let filter = env_filter("GATEHOUSE_TELEMETRY_TEST_UNSET_LEVEL");
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::INFO));
    }

    #[test]
    fn nothing_enabled_installs_nothing() {
        let tracing = Tracing::pre_configured("test", TelemetryOptions {
            console_log_disabled: true,
            ..TelemetryOptions::default()
        })
        .init()
        .expect("no subscriber must be installed");

        assert!(tracing.tracer_provider.is_none());
    }

    #[test]
    fn file_layer_opens_log_directory() {
        let directory = tempfile::tempdir().expect("failed to create temporary directory");
        let tracing = Tracing::pre_configured("test", TelemetryOptions {
            file_log_directory: Some(directory.path().to_path_buf()),
            file_log_max_files: Some(3),
            ..TelemetryOptions::default()
        });

        assert!(tracing.file_layer(directory.path()).is_ok());
    }

    #[test]
    fn file_layer_rejects_file_as_directory() {
        let file = tempfile::NamedTempFile::new().expect("failed to create temporary file");
        let tracing = Tracing::pre_configured("test", TelemetryOptions::default());

        assert!(matches!(
            tracing.file_layer(&file.path().join("logs")),
            Err(Error::OpenLogFile { .. })
        ));
    }
}
