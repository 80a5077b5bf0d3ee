//! Exporters: sinks that receive each finished trace.
//!
//! The [`ExporterCatalog`] knows every exporter this build can construct,
//! keyed by the names the telemetry switch accepts. Names that are known but
//! not usable (missing credentials) or not known at all are skipped with a
//! single warning per name; an export never fails the request it describes.

use crate::TelemetryError;
use crate::langfuse::{LangfuseExporter, LangfuseSettings};
use crate::model::Trace;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// A destination for finished traces.
#[async_trait]
pub trait Exporter: Send + Sync {
    /// Name the switch enables this exporter by.
    fn name(&self) -> &str;

    async fn export(&self, trace: &Trace) -> Result<(), TelemetryError>;
}

/// Writes each trace as a structured log event.
pub struct LogExporter;

#[async_trait]
impl Exporter for LogExporter {
    fn name(&self) -> &str {
        "log"
    }

    async fn export(&self, trace: &Trace) -> Result<(), TelemetryError> {
        info!(
            trace_id = %trace.id,
            name = %trace.name,
            session = trace.session_id.as_deref().unwrap_or("-"),
            spans = trace.spans.len(),
            tokens = trace.total_tokens(),
            cost_usd = trace.total_cost(),
            failed = trace.has_failure(),
            "Trace finished"
        );
        Ok(())
    }
}

/// Registry of constructible exporters, looked up by switch name.
#[derive(Default)]
pub struct ExporterCatalog {
    exporters: HashMap<String, Arc<dyn Exporter>>,
    aliases: HashMap<String, String>,
    /// Known names that cannot be used, with the reason.
    unavailable: HashMap<String, String>,
    warned: Mutex<HashSet<String>>,
}

impl ExporterCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The catalog a client normally uses: `log` always, `langfuse` when
    /// its host and key pair are all present and valid.
    pub fn standard(host: Option<&str>, public_key: Option<&str>, secret_key: Option<&str>) -> Self {
        let mut catalog = Self::new();
        catalog.register(Arc::new(LogExporter));
        catalog.alias("langfuse_otel", "langfuse");

        match LangfuseSettings::from_parts(host, public_key, secret_key)
            .and_then(LangfuseExporter::new)
        {
            Ok(exporter) => catalog.register(Arc::new(exporter)),
            Err(e) => catalog.mark_unavailable("langfuse", e.to_string()),
        }
        catalog
    }

    /// Register an exporter under its own name, replacing any previous one.
    pub fn register(&mut self, exporter: Arc<dyn Exporter>) {
        let name = exporter.name().to_ascii_lowercase();
        self.unavailable.remove(&name);
        self.exporters.insert(name, exporter);
    }

    /// Make `alias` resolve to the exporter named `target`.
    pub fn alias(&mut self, alias: impl Into<String>, target: impl Into<String>) {
        self.aliases.insert(alias.into(), target.into());
    }

    pub fn mark_unavailable(&mut self, name: impl Into<String>, reason: impl Into<String>) {
        self.unavailable.insert(name.into(), reason.into());
    }

    /// Why a known exporter cannot be used, if it cannot.
    pub fn unavailable_reason(&self, name: &str) -> Option<&str> {
        self.unavailable
            .get(self.canonical(name))
            .map(String::as_str)
    }

    pub fn is_available(&self, name: &str) -> bool {
        self.exporters.contains_key(self.canonical(name))
    }

    /// Exporters for the given names, in order, each at most once.
    pub fn resolve(&self, names: &[String]) -> Vec<Arc<dyn Exporter>> {
        let mut out: Vec<Arc<dyn Exporter>> = Vec::new();
        for name in names {
            let canonical = self.canonical(name);
            match self.exporters.get(canonical) {
                Some(exporter) => {
                    if !out.iter().any(|e| Arc::ptr_eq(e, exporter)) {
                        out.push(Arc::clone(exporter));
                    }
                }
                None => {
                    let reason = self
                        .unavailable
                        .get(canonical)
                        .cloned()
                        .unwrap_or_else(|| TelemetryError::UnknownExporter(name.clone()).to_string());
                    self.warn_once(name, &reason);
                }
            }
        }
        out
    }

    /// Send a trace to every enabled exporter. Returns how many accepted it.
    pub async fn export(&self, names: &[String], trace: &Trace) -> usize {
        let mut delivered = 0;
        for exporter in self.resolve(names) {
            match exporter.export(trace).await {
                Ok(()) => {
                    debug!(exporter = exporter.name(), trace_id = %trace.id, "Trace exported");
                    delivered += 1;
                }
                Err(e) => {
                    warn!(exporter = exporter.name(), trace_id = %trace.id, error = %e, "Trace export failed");
                }
            }
        }
        delivered
    }

    fn canonical<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases.get(name).map(String::as_str).unwrap_or(name)
    }

    fn warn_once(&self, name: &str, reason: &str) {
        let mut warned = self.warned.lock().unwrap_or_else(|e| e.into_inner());
        if warned.insert(name.to_string()) {
            warn!(exporter = name, reason, "Telemetry exporter skipped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TraceInfo;

    struct RecordingExporter {
        name: &'static str,
        fail: bool,
        seen: Mutex<Vec<String>>,
    }

    impl RecordingExporter {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Exporter for RecordingExporter {
        fn name(&self) -> &str {
            self.name
        }

        async fn export(&self, trace: &Trace) -> Result<(), TelemetryError> {
            self.seen.lock().unwrap().push(trace.id.clone());
            if self.fail {
                return Err(TelemetryError::Export {
                    exporter: self.name.into(),
                    reason: "boom".into(),
                });
            }
            Ok(())
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn standard_without_credentials_skips_langfuse() {
        let catalog = ExporterCatalog::standard(None, None, None);
        assert!(catalog.is_available("log"));
        assert!(!catalog.is_available("langfuse"));
        assert!(catalog.unavailable_reason("langfuse").is_some());
        // The alias reports the same reason
        assert!(catalog.unavailable_reason("langfuse_otel").is_some());
        assert!(catalog.resolve(&names(&["langfuse"])).is_empty());
    }

    #[test]
    fn standard_with_credentials_enables_langfuse() {
        let catalog = ExporterCatalog::standard(
            Some("https://cloud.langfuse.com"),
            Some("pk-lf-1"),
            Some("sk-lf-1"),
        );
        assert!(catalog.is_available("langfuse"));
        assert!(catalog.is_available("langfuse_otel"));
        // Alias and name resolve to one exporter
        let resolved = catalog.resolve(&names(&["langfuse", "langfuse_otel"]));
        assert_eq!(resolved.len(), 1);
    }

    #[test]
    fn unknown_names_are_skipped() {
        let catalog = ExporterCatalog::standard(None, None, None);
        let resolved = catalog.resolve(&names(&["nope", "log"]));
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].name(), "log");
    }

    #[tokio::test]
    async fn export_counts_deliveries_and_survives_failures() {
        let good = RecordingExporter::new("good", false);
        let bad = RecordingExporter::new("bad", true);
        let mut catalog = ExporterCatalog::new();
        catalog.register(good.clone());
        catalog.register(bad.clone());

        let trace = Trace::new(TraceInfo::new("t"));
        let delivered = catalog.export(&names(&["bad", "good"]), &trace).await;

        assert_eq!(delivered, 1);
        assert_eq!(good.seen.lock().unwrap().len(), 1);
        assert_eq!(bad.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn nothing_enabled_exports_nothing() {
        let good = RecordingExporter::new("good", false);
        let mut catalog = ExporterCatalog::new();
        catalog.register(good.clone());

        let trace = Trace::new(TraceInfo::new("t"));
        assert_eq!(catalog.export(&[], &trace).await, 0);
        assert!(good.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn log_exporter_accepts_traces() {
        let trace = Trace::new(TraceInfo::new("t"));
        LogExporter.export(&trace).await.unwrap();
    }
}
