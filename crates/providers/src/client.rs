//! The client handle the harness and the agent talk to.
//!
//! [`LlmClient`] wraps one routed provider with telemetry: every model call
//! becomes an LLM span inside a trace, every finished trace is handed to the
//! exporters the telemetry switch enables, and usage accumulates into the
//! client's [`Metrics`].

use crate::router::{self, ModelRoute, WireFormat};
use serde_json::{Value, json};
use std::sync::Arc;
use tracecheck_config::{ConfigError, ENV_MODEL, HarnessConfig};
use tracecheck_core::error::ProviderError;
use tracecheck_core::message::Message;
use tracecheck_core::provider::{
    ChunkReceiver, Provider, ProviderRequest, ProviderResponse, RequestMetadata, ToolDefinition,
    Usage,
};
use tracecheck_telemetry::{
    ExporterCatalog, Metrics, ModelPricing, PricingTable, Span, TelemetryEngine, Trace, TraceInfo,
    enabled_exporters,
};
use tracing::{debug, info};

const DEFAULT_TRACE_NAME: &str = "tracecheck-request";

/// Which exporter names a client consults on each call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ExporterSelection {
    /// Read the process-wide telemetry switch on every call.
    #[default]
    Process,
    /// Use this list and ignore the process-wide switch.
    Explicit(Vec<String>),
}

/// A configured model client. Cheap to clone; clones share telemetry.
#[derive(Clone)]
pub struct LlmClient {
    provider: Arc<dyn Provider>,
    model: String,
    route: ModelRoute,
    base_url: String,
    usage_id: String,
    exporters: ExporterSelection,
    catalog: Arc<ExporterCatalog>,
    telemetry: Arc<TelemetryEngine>,
}

impl std::fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmClient")
            .field("provider", &self.provider.name())
            .field("model", &self.model)
            .field("format", &self.route.format)
            .field("base_url", &self.base_url)
            .field("exporters", &self.exporters)
            .finish()
    }
}

impl LlmClient {
    /// Build a client from configuration. Performs no network I/O.
    pub fn new(config: &HarnessConfig) -> Result<Self, ConfigError> {
        Self::builder(config).build()
    }

    pub fn builder(config: &HarnessConfig) -> LlmClientBuilder {
        LlmClientBuilder::from_config(config)
    }

    /// Model id as configured, routing prefix included.
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn usage_id(&self) -> &str {
        &self.usage_id
    }

    pub fn wire_format(&self) -> WireFormat {
        self.route.format
    }

    /// Snapshot of the usage accumulated by this client and its clones.
    pub fn metrics(&self) -> Metrics {
        self.telemetry.metrics()
    }

    pub fn telemetry(&self) -> &TelemetryEngine {
        &self.telemetry
    }

    pub fn catalog(&self) -> &ExporterCatalog {
        &self.catalog
    }

    /// Exporter names in effect for the next call.
    pub fn active_exporters(&self) -> Vec<String> {
        match &self.exporters {
            ExporterSelection::Process => enabled_exporters().to_vec(),
            ExporterSelection::Explicit(names) => names.clone(),
        }
    }

    /// Issue a streamed chat request.
    ///
    /// The request is sent before this returns; the answer is read by
    /// [`ResponseStream::collect_text`], which also closes and exports the
    /// trace. A send failure is recorded and exported before it is returned.
    pub async fn request(
        &self,
        messages: Vec<Message>,
        metadata: RequestMetadata,
    ) -> Result<ResponseStream, ProviderError> {
        let trace_id = self.open_trace(&metadata, messages_json(&messages));
        let prompt_estimate = estimate_prompt(&messages);
        let span = Span::llm_call(&self.model).with_input(messages_json(&messages));

        let mut request = ProviderRequest::new(&self.route.wire_model, messages);
        request.stream = true;

        info!(model = %self.model, trace_id = %trace_id, "Sending streamed request");
        match self.provider.stream(request).await {
            Ok(rx) => Ok(ResponseStream {
                client: self.clone(),
                trace_id,
                span,
                prompt_estimate,
                rx,
            }),
            Err(e) => {
                self.record_llm_span(&trace_id, span, Err(&e), prompt_estimate);
                self.close_trace(&trace_id, json!({ "error": e.to_string() }))
                    .await;
                Err(e)
            }
        }
    }

    /// One aggregate call in its own trace.
    pub async fn complete(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
        metadata: RequestMetadata,
    ) -> Result<ProviderResponse, ProviderError> {
        let trace_id = self.open_trace(&metadata, messages_json(&messages));
        let result = self.complete_traced(&trace_id, None, &messages, &tools).await;
        let output = match &result {
            Ok(resp) => json!(resp.message.content),
            Err(e) => json!({ "error": e.to_string() }),
        };
        self.close_trace(&trace_id, output).await;
        result
    }

    /// Open a trace labelled from `metadata`; returns its id.
    pub fn open_trace(&self, metadata: &RequestMetadata, input: Value) -> String {
        let mut info = TraceInfo::new(
            metadata
                .trace_name
                .clone()
                .unwrap_or_else(|| DEFAULT_TRACE_NAME.to_string()),
        );
        info.session_id = metadata.session_id.clone();
        info.tags = metadata.tags.clone();
        info.input = input;
        info.metadata.insert("usage_id".into(), json!(self.usage_id));
        info.metadata.insert("model".into(), json!(self.model));
        info.metadata.insert("provider".into(), json!(self.provider.name()));
        self.telemetry.start_trace(info)
    }

    /// An aggregate call recorded as an LLM span in an open trace.
    pub async fn complete_traced(
        &self,
        trace_id: &str,
        parent_span: Option<&str>,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<ProviderResponse, ProviderError> {
        let prompt_estimate = estimate_prompt(messages);
        let mut span = Span::llm_call(&self.model).with_input(messages_json(messages));
        if let Some(parent) = parent_span {
            span = span.with_parent(parent);
        }

        let mut request = ProviderRequest::new(&self.route.wire_model, messages.to_vec());
        request.tools = tools.to_vec();

        debug!(model = %self.model, trace_id, tools = tools.len(), "Sending completion");
        let result = self.provider.complete(request).await;
        match &result {
            Ok(resp) => {
                let output = json!({
                    "content": resp.message.content,
                    "tool_calls": resp.message.tool_calls,
                });
                let completion_estimate = resp.message.estimated_tokens();
                self.record_llm_span(
                    trace_id,
                    span,
                    Ok((output, resp.usage, completion_estimate)),
                    prompt_estimate,
                );
            }
            Err(e) => self.record_llm_span(trace_id, span, Err(e), prompt_estimate),
        }
        result
    }

    /// Record a non-LLM span (tool execution, agent run) in an open trace.
    pub fn record_span(&self, trace_id: &str, span: Span) {
        self.telemetry.record_span(trace_id, span);
    }

    /// Close a trace and send it to the active exporters.
    pub async fn close_trace(&self, trace_id: &str, output: Value) -> Option<Trace> {
        let trace = self.telemetry.end_trace(trace_id, output)?;
        let names = self.active_exporters();
        let delivered = self.catalog.export(&names, &trace).await;
        debug!(trace_id, exporters = ?names, delivered, "Trace closed");
        Some(trace)
    }

    fn record_llm_span(
        &self,
        trace_id: &str,
        mut span: Span,
        outcome: Result<(Value, Option<Usage>, u32), &ProviderError>,
        prompt_estimate: u32,
    ) {
        match outcome {
            Ok((output, usage, completion_estimate)) => {
                let usage = usage.unwrap_or_else(|| {
                    span.metadata.insert("usage_estimated".into(), json!(true));
                    Usage::new(prompt_estimate, completion_estimate)
                });
                let cost = self.telemetry.compute_cost(
                    &self.model,
                    usage.prompt_tokens,
                    usage.completion_tokens,
                );
                span.record_tokens(usage.prompt_tokens, usage.completion_tokens, cost);
                span.output = output;
                span.end(true);
            }
            Err(e) => span.fail(e.to_string()),
        }
        self.telemetry.record_span(trace_id, span);
    }
}

/// A streamed answer. Finite and single-use: draining consumes it.
pub struct ResponseStream {
    client: LlmClient,
    trace_id: String,
    span: Span,
    prompt_estimate: u32,
    rx: ChunkReceiver,
}

impl ResponseStream {
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Drain the stream into one string.
    ///
    /// Empty fragments are skipped. A stream that ends with no content at
    /// all is [`ProviderError::EmptyStream`]. Either way the call is
    /// recorded and the trace exported before this returns.
    pub async fn collect_text(mut self) -> Result<String, ProviderError> {
        let mut text = String::new();
        let mut fragments = 0usize;
        let mut usage = None;

        let outcome = loop {
            match self.rx.recv().await {
                Some(Ok(chunk)) => {
                    if let Some(content) = chunk.content.filter(|c| !c.is_empty()) {
                        text.push_str(&content);
                        fragments += 1;
                    }
                    if chunk.usage.is_some() {
                        usage = chunk.usage;
                    }
                    if chunk.done {
                        break Ok(());
                    }
                }
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            }
        };
        let outcome = outcome.and_then(|()| {
            if fragments == 0 {
                Err(ProviderError::EmptyStream)
            } else {
                Ok(())
            }
        });

        let client = &self.client;
        match outcome {
            Ok(()) => {
                let completion_estimate =
                    u32::try_from(text.len().div_ceil(4)).unwrap_or(u32::MAX);
                client.record_llm_span(
                    &self.trace_id,
                    self.span,
                    Ok((json!(text), usage, completion_estimate)),
                    self.prompt_estimate,
                );
                client.close_trace(&self.trace_id, json!(text)).await;
                debug!(trace_id = %self.trace_id, fragments, chars = text.len(), "Stream drained");
                Ok(text)
            }
            Err(e) => {
                client.record_llm_span(&self.trace_id, self.span, Err(&e), self.prompt_estimate);
                client
                    .close_trace(&self.trace_id, json!({ "error": e.to_string() }))
                    .await;
                Err(e)
            }
        }
    }
}

/// Builder for [`LlmClient`]; starts from configuration.
pub struct LlmClientBuilder {
    provider_name: String,
    base_url: String,
    base_url_var: String,
    api_key: String,
    model: String,
    usage_id: String,
    langfuse: [Option<String>; 3],
    custom_pricing: Vec<(String, ModelPricing)>,
    exporters: ExporterSelection,
    catalog: Option<ExporterCatalog>,
    provider: Option<Arc<dyn Provider>>,
}

impl LlmClientBuilder {
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            provider_name: config.provider.to_ascii_lowercase(),
            base_url: config.base_url.clone(),
            base_url_var: config.base_url_var(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            usage_id: config.usage_id.clone(),
            langfuse: [
                config.telemetry.host.clone(),
                config.telemetry.public_key.clone(),
                config.telemetry.secret_key.clone(),
            ],
            custom_pricing: config
                .telemetry
                .custom_pricing
                .iter()
                .map(|(model, p)| (model.clone(), ModelPricing::new(p.input_per_m, p.output_per_m)))
                .collect(),
            exporters: ExporterSelection::Process,
            catalog: None,
            provider: None,
        }
    }

    /// Use these exporters instead of the process-wide switch.
    pub fn exporters<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = names
            .into_iter()
            .map(|n| n.as_ref().trim().to_ascii_lowercase())
            .filter(|n| !n.is_empty())
            .collect();
        self.exporters = ExporterSelection::Explicit(names);
        self
    }

    /// Replace the standard exporter catalog.
    pub fn catalog(mut self, catalog: ExporterCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Talk to `provider` instead of the one the model id routes to.
    pub fn provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn build(self) -> Result<LlmClient, ConfigError> {
        if self.model.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: ENV_MODEL.into(),
                reason: "model identifier is empty".into(),
            });
        }
        validate_base_url(&self.base_url_var, &self.base_url)?;

        let route = router::route(&self.model);
        let provider = match self.provider {
            Some(p) => p,
            None => router::build_provider(
                &self.provider_name,
                route.format,
                &self.base_url,
                &self.api_key,
            )
            .map_err(|e| ConfigError::InvalidValue {
                key: self.base_url_var.clone(),
                reason: e.to_string(),
            })?,
        };

        let pricing = PricingTable::with_defaults();
        for (model, p) in self.custom_pricing {
            pricing.set(model, p);
        }

        let [host, public_key, secret_key] = self.langfuse;
        let catalog = self.catalog.unwrap_or_else(|| {
            ExporterCatalog::standard(host.as_deref(), public_key.as_deref(), secret_key.as_deref())
        });

        debug!(
            provider = provider.name(),
            model = %self.model,
            format = %route.format,
            "Client constructed"
        );

        Ok(LlmClient {
            provider,
            model: self.model,
            route,
            base_url: self.base_url,
            usage_id: self.usage_id,
            exporters: self.exporters,
            catalog: Arc::new(catalog),
            telemetry: Arc::new(TelemetryEngine::with_pricing(pricing)),
        })
    }
}

fn validate_base_url(key: &str, raw: &str) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidValue {
        key: key.to_string(),
        reason,
    };
    let url = url::Url::parse(raw).map_err(|e| invalid(format!("{raw:?} is not a URL: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("{raw:?} must use http or https")));
    }
    if url.host_str().is_none() {
        return Err(invalid(format!("{raw:?} has no host")));
    }
    Ok(())
}

fn messages_json(messages: &[Message]) -> Value {
    Value::Array(
        messages
            .iter()
            .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
            .collect(),
    )
}

fn estimate_prompt(messages: &[Message]) -> u32 {
    messages.iter().map(Message::estimated_tokens).sum()
}
