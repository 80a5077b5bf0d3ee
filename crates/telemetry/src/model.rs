//! Traces and spans: what one request looked like from the client's side.
//!
//! A [`Trace`] covers one client request (direct mode) or one agent run.
//! It carries the labels the telemetry backend indexes on (name, session,
//! tags) and the spans recorded while it was open.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The kind of work a span represents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    /// A model completion call.
    LlmCall,
    /// A tool execution inside the agent loop.
    ToolExecution,
    /// The agent run that groups model calls and tool executions.
    AgentRun,
}

impl std::fmt::Display for SpanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LlmCall => write!(f, "llm_call"),
            Self::ToolExecution => write!(f, "tool_execution"),
            Self::AgentRun => write!(f, "agent_run"),
        }
    }
}

/// A single traced execution unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub id: String,
    /// Parent span id (None for root spans).
    pub parent_id: Option<String>,
    pub kind: SpanKind,
    /// Tool name, or the model name for LLM calls.
    pub label: String,
    /// Model identifier as configured (LLM calls only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub cost_usd: Option<f64>,
    pub success: Option<bool>,
    /// What went in: messages for LLM calls, arguments for tools.
    #[serde(default)]
    pub input: Value,
    /// What came out: response text or tool output.
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

impl Span {
    pub fn new(kind: SpanKind, label: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: None,
            kind,
            label: label.into(),
            model: None,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            input_tokens: None,
            output_tokens: None,
            cost_usd: None,
            success: None,
            input: Value::Null,
            output: Value::Null,
            error: None,
            metadata: serde_json::Map::new(),
        }
    }

    /// An LLM call span labelled with its model.
    pub fn llm_call(model: impl Into<String>) -> Self {
        let model = model.into();
        let mut span = Self::new(SpanKind::LlmCall, model.clone());
        span.model = Some(model);
        span
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    /// Mark the span as ended with the given success status.
    pub fn end(&mut self, success: bool) {
        let now = Utc::now();
        self.ended_at = Some(now);
        self.duration_ms = Some(
            now.signed_duration_since(self.started_at)
                .num_milliseconds()
                .max(0) as u64,
        );
        self.success = Some(success);
    }

    /// End the span as failed, keeping the error message.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.end(false);
    }

    pub fn record_tokens(&mut self, input: u32, output: u32, cost: f64) {
        self.input_tokens = Some(input);
        self.output_tokens = Some(output);
        self.cost_usd = Some(cost);
    }

    /// Total tokens (input + output), or 0 if not recorded.
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens.unwrap_or(0) + self.output_tokens.unwrap_or(0)
    }
}

/// Labels for a trace, supplied when it is opened.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    #[serde(default)]
    pub input: Value,
}

impl TraceInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// A collection of spans representing one request or agent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub id: String,
    pub name: String,
    pub session_id: Option<String>,
    pub tags: Vec<String>,
    pub metadata: serde_json::Map<String, Value>,
    pub input: Value,
    pub output: Value,
    pub spans: Vec<Span>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Trace {
    pub fn new(info: TraceInfo) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: info.name,
            session_id: info.session_id,
            tags: info.tags,
            metadata: info.metadata,
            input: info.input,
            output: Value::Null,
            spans: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn add_span(&mut self, span: Span) {
        self.spans.push(span);
    }

    /// Mark the trace as complete with its final output.
    pub fn end(&mut self, output: Value) {
        self.output = output;
        self.ended_at = Some(Utc::now());
    }

    /// Total cost across all spans in USD.
    pub fn total_cost(&self) -> f64 {
        self.spans.iter().filter_map(|s| s.cost_usd).sum()
    }

    pub fn total_tokens(&self) -> u32 {
        self.spans.iter().map(Span::total_tokens).sum()
    }

    pub fn llm_call_count(&self) -> usize {
        self.count(SpanKind::LlmCall)
    }

    pub fn tool_execution_count(&self) -> usize {
        self.count(SpanKind::ToolExecution)
    }

    /// Whether any span in the trace failed.
    pub fn has_failure(&self) -> bool {
        self.spans.iter().any(|s| s.success == Some(false))
    }

    fn count(&self, kind: SpanKind) -> usize {
        self.spans.iter().filter(|s| s.kind == kind).count()
    }
}
