//! Thread-safe telemetry engine: collects spans, costs them, and keeps the
//! accumulated usage metrics a client reports.

use crate::model::{Span, SpanKind, Trace, TraceInfo};
use crate::pricing::PricingTable;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::RwLock;

/// Completed traces kept in memory before the oldest are dropped.
const MAX_TRACES: usize = 1_000;

/// Accumulated usage for one client.
///
/// Every counter only grows for the lifetime of the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Total cost in USD.
    pub accumulated_cost: f64,
    pub accumulated_input_tokens: u64,
    pub accumulated_output_tokens: u64,
    pub accumulated_total_tokens: u64,
    /// Model calls recorded, successful or not.
    pub request_count: u64,
    pub tool_executions: u64,
}

/// The telemetry engine owned by a client.
pub struct TelemetryEngine {
    pricing: PricingTable,
    /// Open and recently completed traces (most recent last).
    traces: RwLock<Vec<Trace>>,
    metrics: RwLock<Metrics>,
}

impl TelemetryEngine {
    pub fn new() -> Self {
        Self::with_pricing(PricingTable::with_defaults())
    }

    pub fn with_pricing(pricing: PricingTable) -> Self {
        Self {
            pricing,
            traces: RwLock::new(Vec::new()),
            metrics: RwLock::new(Metrics::default()),
        }
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    /// Open a trace and return its id.
    pub fn start_trace(&self, info: TraceInfo) -> String {
        let trace = Trace::new(info);
        let id = trace.id.clone();
        let mut traces = self.traces.write().unwrap_or_else(|e| e.into_inner());

        if traces.len() >= MAX_TRACES {
            // Drop the oldest completed tenth; open traces are never pruned.
            let drain_count = MAX_TRACES / 10;
            let mut removed = 0;
            traces.retain(|t| {
                if removed >= drain_count || t.ended_at.is_none() {
                    return true;
                }
                removed += 1;
                false
            });
        }

        traces.push(trace);
        id
    }

    /// Record a finished span in a trace and update the metrics.
    ///
    /// Metrics are updated even if the trace id is unknown.
    pub fn record_span(&self, trace_id: &str, span: Span) {
        {
            let mut metrics = self.metrics.write().unwrap_or_else(|e| e.into_inner());
            match span.kind {
                SpanKind::LlmCall => {
                    let input = span.input_tokens.unwrap_or(0) as u64;
                    let output = span.output_tokens.unwrap_or(0) as u64;
                    metrics.accumulated_input_tokens += input;
                    metrics.accumulated_output_tokens += output;
                    metrics.accumulated_total_tokens += input + output;
                    metrics.accumulated_cost += span.cost_usd.unwrap_or(0.0).max(0.0);
                    metrics.request_count += 1;
                }
                SpanKind::ToolExecution => metrics.tool_executions += 1,
                SpanKind::AgentRun => {}
            }
        }

        let mut traces = self.traces.write().unwrap_or_else(|e| e.into_inner());
        match traces.iter_mut().find(|t| t.id == trace_id) {
            Some(trace) => trace.add_span(span),
            None => tracing::debug!(trace_id, "Span recorded for unknown trace"),
        }
    }

    /// Close a trace and return a copy of it for export.
    pub fn end_trace(&self, trace_id: &str, output: Value) -> Option<Trace> {
        let mut traces = self.traces.write().unwrap_or_else(|e| e.into_inner());
        let trace = traces.iter_mut().find(|t| t.id == trace_id)?;
        trace.end(output);
        Some(trace.clone())
    }

    pub fn compute_cost(&self, model: &str, input_tokens: u32, output_tokens: u32) -> f64 {
        self.pricing.compute_cost(model, input_tokens, output_tokens)
    }

    /// Snapshot of the accumulated metrics.
    pub fn metrics(&self) -> Metrics {
        *self.metrics.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get_trace(&self, trace_id: &str) -> Option<Trace> {
        let traces = self.traces.read().unwrap_or_else(|e| e.into_inner());
        traces.iter().find(|t| t.id == trace_id).cloned()
    }

    pub fn trace_count(&self) -> usize {
        self.traces.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for TelemetryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn llm_span(engine: &TelemetryEngine, input: u32, output: u32) -> Span {
        let mut span = Span::llm_call("glm-4.7");
        let cost = engine.compute_cost("glm-4.7", input, output);
        span.record_tokens(input, output, cost);
        span.end(true);
        span
    }

    #[test]
    fn start_and_end_trace() {
        let engine = TelemetryEngine::new();
        let id = engine.start_trace(TraceInfo::new("direct-request"));
        assert_eq!(engine.trace_count(), 1);
        assert!(engine.get_trace(&id).unwrap().ended_at.is_none());

        let trace = engine.end_trace(&id, json!("done")).unwrap();
        assert!(trace.ended_at.is_some());
        assert_eq!(trace.output, json!("done"));
    }

    #[test]
    fn end_unknown_trace_is_none() {
        let engine = TelemetryEngine::new();
        assert!(engine.end_trace("missing", Value::Null).is_none());
    }

    #[test]
    fn record_span_updates_metrics() {
        let engine = TelemetryEngine::new();
        let id = engine.start_trace(TraceInfo::new("t"));
        engine.record_span(&id, llm_span(&engine, 1000, 500));

        let m = engine.metrics();
        assert_eq!(m.accumulated_input_tokens, 1000);
        assert_eq!(m.accumulated_output_tokens, 500);
        assert_eq!(m.accumulated_total_tokens, 1500);
        assert_eq!(m.request_count, 1);
        assert!(m.accumulated_cost > 0.0);
        assert_eq!(engine.get_trace(&id).unwrap().spans.len(), 1);
    }

    #[test]
    fn tool_spans_count_executions_only() {
        let engine = TelemetryEngine::new();
        let id = engine.start_trace(TraceInfo::new("agent"));
        let mut span = Span::new(SpanKind::ToolExecution, "terminal");
        span.end(true);
        engine.record_span(&id, span);

        let m = engine.metrics();
        assert_eq!(m.tool_executions, 1);
        assert_eq!(m.request_count, 0);
        assert_eq!(m.accumulated_total_tokens, 0);
    }

    #[test]
    fn metrics_are_monotonic() {
        let engine = TelemetryEngine::new();
        let id = engine.start_trace(TraceInfo::new("t"));
        engine.record_span(&id, llm_span(&engine, 10, 5));
        let first = engine.metrics();

        engine.record_span(&id, llm_span(&engine, 20, 7));
        let second = engine.metrics();

        assert!(second.accumulated_total_tokens >= first.accumulated_total_tokens);
        assert!(second.accumulated_cost > first.accumulated_cost);
        assert_eq!(second.request_count, 2);
    }

    #[test]
    fn unpriced_model_costs_nothing() {
        let engine = TelemetryEngine::new();
        assert!(engine.compute_cost("unpriced/model", 1000, 1000).abs() < 1e-12);
    }

    #[test]
    fn old_completed_traces_are_pruned() {
        let engine = TelemetryEngine::new();
        for _ in 0..MAX_TRACES {
            let id = engine.start_trace(TraceInfo::new("t"));
            engine.end_trace(&id, Value::Null);
        }
        engine.start_trace(TraceInfo::new("t"));
        assert_eq!(engine.trace_count(), MAX_TRACES - MAX_TRACES / 10 + 1);
    }
}
