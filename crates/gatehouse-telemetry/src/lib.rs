//! This crate initialises the tracing subscribers of the gatehouse webhooks:
//! console output, rolling file output and OpenTelemetry OTLP trace export.
//! See [`Tracing`] to get started.
pub mod tracing;

pub use tracing::{TelemetryOptions, Tracing};
