//! The telemetry switch: which exporters receive traces.
//!
//! The process-wide registry is written once at startup, before any client
//! call, and read by every client on every call afterwards. Re-setting the
//! same list is a no-op; a different list after the first write is refused.
//!
//! Clients that need their own selection (tests, several differently
//! configured clients in one process) pass an explicit list instead of
//! consulting the global.

use crate::TelemetryError;
use std::sync::OnceLock;

static GLOBAL: ExporterRegistry = ExporterRegistry::new();

/// A write-once list of enabled exporter names.
#[derive(Debug, Default)]
pub struct ExporterRegistry {
    enabled: OnceLock<Vec<String>>,
}

impl ExporterRegistry {
    pub const fn new() -> Self {
        Self {
            enabled: OnceLock::new(),
        }
    }

    /// The process-wide registry.
    pub fn global() -> &'static ExporterRegistry {
        &GLOBAL
    }

    /// Enable the given exporters.
    ///
    /// Names are trimmed, lowercased and de-duplicated (first occurrence
    /// wins). Calling again with a list that normalizes to the same value
    /// succeeds without change.
    pub fn set_enabled_exporters<I, S>(&self, names: I) -> Result<&[String], TelemetryError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let requested = normalize(names);
        let current = self.enabled.get_or_init(|| requested.clone());
        if *current != requested {
            return Err(TelemetryError::SwitchAlreadySet {
                current: current.clone(),
                requested,
            });
        }
        tracing::debug!(exporters = ?current, "Telemetry exporters enabled");
        Ok(current)
    }

    /// Currently enabled exporters; empty until the switch is set.
    pub fn enabled(&self) -> &[String] {
        self.enabled.get().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_set(&self) -> bool {
        self.enabled.get().is_some()
    }
}

/// Enable exporters on the process-wide registry.
pub fn set_enabled_exporters<I, S>(names: I) -> Result<&'static [String], TelemetryError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    GLOBAL.set_enabled_exporters(names)
}

/// Exporters enabled on the process-wide registry.
pub fn enabled_exporters() -> &'static [String] {
    GLOBAL.enabled()
}

fn normalize<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for name in names {
        let name = name.as_ref().trim().to_ascii_lowercase();
        if !name.is_empty() && !out.contains(&name) {
            out.push(name);
        }
    }
    out
}
