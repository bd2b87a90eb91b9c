//! Command line and environment options of the subscribers.
use std::path::PathBuf;

use tracing_appender::rolling::Rotation;

/// Options passed to [`Tracing::pre_configured`](super::Tracing::pre_configured).
///
/// With the `clap` feature enabled, they can be flattened into the arguments
/// of a webhook binary.
#[cfg_attr(feature = "clap", derive(clap::Args))]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TelemetryOptions {
    /// Disable console logs.
    #[cfg_attr(feature = "clap", arg(long, env))]
    pub console_log_disabled: bool,

    /// Output format of the console logs.
    #[cfg_attr(feature = "clap", arg(long, env, value_enum, default_value_t))]
    pub console_log_format: LogFormat,

    /// Write JSON logs to files located in DIRECTORY.
    #[cfg_attr(
        feature = "clap",
        arg(long, env, value_name = "DIRECTORY", group = "file_log")
    )]
    pub file_log_directory: Option<PathBuf>,

    /// Time PERIOD after which log files are rolled over.
    #[cfg_attr(
        feature = "clap",
        arg(long, env, value_name = "PERIOD", requires = "file_log")
    )]
    pub file_log_rotation_period: Option<RotationPeriod>,

    /// Maximum number of log files to keep.
    #[cfg_attr(feature = "clap", arg(long, env, requires = "file_log"))]
    pub file_log_max_files: Option<usize>,

    /// Export spans via OTLP. The exporter reads the standard
    /// `OTEL_EXPORTER_OTLP_*` variables.
    #[cfg_attr(feature = "clap", arg(long, env))]
    pub otel_trace_exporter_enabled: bool,
}

/// How console log events are rendered.
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines. Set `NO_COLOR` to disable ANSI colors.
    #[default]
    Plain,

    /// One JSON object per event.
    Json,
}

/// When log files are rolled over.
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "PascalCase")]
pub enum RotationPeriod {
    Minutely,
    Hourly,
    Daily,

    #[default]
    Never,
}

impl From<RotationPeriod> for Rotation {
    fn from(value: RotationPeriod) -> Self {
        match value {
            RotationPeriod::Minutely => Self::MINUTELY,
            RotationPeriod::Hourly => Self::HOURLY,
            RotationPeriod::Daily => Self::DAILY,
            RotationPeriod::Never => Self::NEVER,
        }
    }
}
