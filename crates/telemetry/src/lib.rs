//! Telemetry forwarding, usage metrics and cost tracking for tracecheck.
//!
//! - [`switch`]: the process-wide, write-once list of enabled exporters.
//! - [`model`]: traces and spans describing each request.
//! - [`engine`]: records spans and keeps the accumulated [`Metrics`].
//! - [`pricing`]: per-model token prices used to cost each call.
//! - [`exporter`] / [`langfuse`]: sinks that receive finished traces.

pub mod engine;
pub mod exporter;
pub mod langfuse;
pub mod model;
pub mod pricing;
pub mod switch;

pub use engine::{Metrics, TelemetryEngine};
pub use exporter::{Exporter, ExporterCatalog, LogExporter};
pub use langfuse::{LangfuseExporter, LangfuseSettings};
pub use model::{Span, SpanKind, Trace, TraceInfo};
pub use pricing::{ModelPricing, PricingTable};
pub use switch::{ExporterRegistry, enabled_exporters, set_enabled_exporters};

/// Errors from the telemetry subsystem.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("telemetry switch already set to {current:?}, refusing {requested:?}")]
    SwitchAlreadySet {
        current: Vec<String>,
        requested: Vec<String>,
    },

    #[error("unknown exporter: {0}")]
    UnknownExporter(String),

    #[error("invalid exporter setting: {0}")]
    InvalidSetting(String),

    #[error("export to {exporter} failed: {reason}")]
    Export { exporter: String, reason: String },

    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}
