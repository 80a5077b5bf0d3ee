//! Langfuse exporter.
//!
//! Finished traces are posted to the public ingestion API as one batch per
//! trace: a `trace-create` event, a `generation-create` event per model call
//! and a `span-create` event for everything else.

use crate::TelemetryError;
use crate::exporter::Exporter;
use crate::model::{Span, SpanKind, Trace};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

const INGESTION_PATH: &str = "/api/public/ingestion";
const EXPORT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where and as whom to send traces.
#[derive(Clone)]
pub struct LangfuseSettings {
    pub host: String,
    pub public_key: String,
    pub secret_key: String,
}

impl std::fmt::Debug for LangfuseSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LangfuseSettings")
            .field("host", &self.host)
            .field("public_key", &self.public_key)
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

impl LangfuseSettings {
    /// Build settings from optional parts, naming the first one missing.
    pub fn from_parts(
        host: Option<&str>,
        public_key: Option<&str>,
        secret_key: Option<&str>,
    ) -> Result<Self, TelemetryError> {
        let require = |value: Option<&str>, key: &str| {
            value
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .ok_or_else(|| TelemetryError::InvalidSetting(format!("{key} is not set")))
        };
        let host = require(host, "LANGFUSE_HOST")?;
        let public_key = require(public_key, "LANGFUSE_PUBLIC_KEY")?;
        let secret_key = require(secret_key, "LANGFUSE_SECRET_KEY")?;

        let parsed = url::Url::parse(&host)
            .map_err(|e| TelemetryError::InvalidSetting(format!("LANGFUSE_HOST {host:?}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(TelemetryError::InvalidSetting(format!(
                "LANGFUSE_HOST {host:?}: scheme must be http or https"
            )));
        }

        Ok(Self {
            host: host.trim_end_matches('/').to_string(),
            public_key,
            secret_key,
        })
    }

    pub fn ingestion_url(&self) -> String {
        format!("{}{INGESTION_PATH}", self.host)
    }
}

/// Sends traces to a Langfuse ingestion endpoint.
pub struct LangfuseExporter {
    client: reqwest::Client,
    settings: LangfuseSettings,
}

#[derive(Debug, Default, Deserialize)]
struct IngestionResponse {
    #[serde(default)]
    errors: Vec<Value>,
}

impl LangfuseExporter {
    pub fn new(settings: LangfuseSettings) -> Result<Self, TelemetryError> {
        let client = reqwest::Client::builder()
            .timeout(EXPORT_TIMEOUT)
            .build()
            .map_err(|e| TelemetryError::InvalidSetting(format!("HTTP client: {e}")))?;
        Ok(Self { client, settings })
    }

    pub fn settings(&self) -> &LangfuseSettings {
        &self.settings
    }

    fn failure(&self, reason: impl Into<String>) -> TelemetryError {
        TelemetryError::Export {
            exporter: self.name().to_string(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Exporter for LangfuseExporter {
    fn name(&self) -> &str {
        "langfuse"
    }

    async fn export(&self, trace: &Trace) -> Result<(), TelemetryError> {
        let batch = build_batch(trace);
        let events = batch["batch"].as_array().map_or(0, Vec::len);

        let response = self
            .client
            .post(self.settings.ingestion_url())
            .basic_auth(&self.settings.public_key, Some(&self.settings.secret_key))
            .json(&batch)
            .send()
            .await
            .map_err(|e| self.failure(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.failure(format!("HTTP {status}: {body}")));
        }

        // 207 carries per-event results; an unreadable body still means accepted.
        let parsed: IngestionResponse = response.json().await.unwrap_or_default();
        if !parsed.errors.is_empty() {
            return Err(self.failure(format!(
                "{} of {events} events rejected: {}",
                parsed.errors.len(),
                Value::Array(parsed.errors)
            )));
        }

        debug!(trace_id = %trace.id, events, "Langfuse batch accepted");
        Ok(())
    }
}

/// The ingestion payload for one trace.
pub fn build_batch(trace: &Trace) -> Value {
    let now = timestamp(&Utc::now());
    let mut events = Vec::with_capacity(trace.spans.len() + 1);

    events.push(event(
        "trace-create",
        &now,
        json!({
            "id": trace.id,
            "name": trace.name,
            "sessionId": trace.session_id,
            "tags": trace.tags,
            "metadata": trace.metadata,
            "input": trace.input,
            "output": trace.output,
            "timestamp": timestamp(&trace.started_at),
        }),
    ));

    for span in &trace.spans {
        let (kind, body) = match span.kind {
            SpanKind::LlmCall => ("generation-create", generation_body(trace, span)),
            SpanKind::ToolExecution | SpanKind::AgentRun => ("span-create", span_body(trace, span)),
        };
        events.push(event(kind, &now, body));
    }

    json!({ "batch": events })
}

fn event(kind: &str, now: &str, body: Value) -> Value {
    json!({
        "id": uuid::Uuid::new_v4().to_string(),
        "type": kind,
        "timestamp": now,
        "body": body,
    })
}

fn span_body(trace: &Trace, span: &Span) -> Value {
    let level = if span.success == Some(false) {
        "ERROR"
    } else {
        "DEFAULT"
    };
    let mut body = json!({
        "id": span.id,
        "traceId": trace.id,
        "name": span.label,
        "startTime": timestamp(&span.started_at),
        "endTime": span.ended_at.as_ref().map(timestamp),
        "input": span.input,
        "output": span.output,
        "metadata": span.metadata,
        "level": level,
    });
    if let Some(parent) = &span.parent_id {
        body["parentObservationId"] = json!(parent);
    }
    if let Some(error) = &span.error {
        body["statusMessage"] = json!(error);
    }
    body
}

fn generation_body(trace: &Trace, span: &Span) -> Value {
    let mut body = span_body(trace, span);
    let input = span.input_tokens.unwrap_or(0);
    let output = span.output_tokens.unwrap_or(0);
    let cost = span.cost_usd.unwrap_or(0.0);

    body["model"] = json!(span.model.as_deref().unwrap_or(&span.label));
    body["usage"] = json!({
        "input": input,
        "output": output,
        "total": input + output,
        "unit": "TOKENS",
    });
    body["costDetails"] = json!({ "total": cost });
    body["totalCost"] = json!(cost);
    body
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
