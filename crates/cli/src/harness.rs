//! The verification harness: one configured request, then a report.
//!
//! [`Harness::run`] walks the fixed sequence an operator expects:
//!
//! 1. Load configuration (fatal on missing credentials)
//! 2. Enable telemetry exporters process-wide
//! 3. Construct the client (no network I/O)
//! 4. Issue one request, directly or through the agent
//! 5. Print usage metrics
//! 6. Print the closing banner pointing at the telemetry UI
//!
//! Only step 1 and 3 can fail the run. Anything that goes wrong in step 4 is
//! caught, classified and printed, and the closing banner still appears.

use anyhow::Context;
use std::backtrace::BacktraceStatus;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use tracecheck_agent::{Agent, Conversation};
use tracecheck_config::{
    ConfigError, DotenvStatus, FileConfig, HarnessConfig, Mode, Overrides, load_dotenv,
};
use tracecheck_core::error::{Error as CoreError, ProviderError, ToolError};
use tracecheck_core::message::Message;
use tracecheck_core::provider::RequestMetadata;
use tracecheck_providers::LlmClient;
use tracecheck_telemetry::{ExporterRegistry, Metrics, TelemetryError};
use tracing::{info, warn};

const RULE: &str = "============================================================";

/// Everything that can stop the harness before the request step.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to write report: {0}")]
    Io(#[from] std::io::Error),
}

/// How the request step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Connection refused, DNS failure or timeout
    Unreachable,
    Auth,
    RateLimited,
    /// Non-2xx status other than auth and rate limiting
    Api,
    /// Unparseable body or interrupted stream
    Malformed,
    /// The stream ended without any content
    EmptyResponse,
    Tool,
    Other,
}

impl FailureKind {
    /// Classify an error by the first provider or tool error in its chain.
    pub fn classify(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if let Some(e) = cause.downcast_ref::<ProviderError>() {
                return Self::from_provider(e);
            }
            if cause.downcast_ref::<ToolError>().is_some() {
                return Self::Tool;
            }
            if let Some(e) = cause.downcast_ref::<CoreError>() {
                match e {
                    CoreError::Provider(p) => return Self::from_provider(p),
                    CoreError::Tool(_) => return Self::Tool,
                    _ => {}
                }
            }
        }
        Self::Other
    }

    fn from_provider(e: &ProviderError) -> Self {
        match e {
            ProviderError::Network(_) | ProviderError::Timeout(_) => Self::Unreachable,
            ProviderError::AuthenticationFailed(_) => Self::Auth,
            ProviderError::RateLimited { .. } => Self::RateLimited,
            ProviderError::ApiError { .. } | ProviderError::NotConfigured(_) => Self::Api,
            ProviderError::MalformedResponse(_) | ProviderError::StreamInterrupted(_) => {
                Self::Malformed
            }
            ProviderError::EmptyStream => Self::EmptyResponse,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unreachable => "endpoint unreachable",
            Self::Auth => "authentication failed",
            Self::RateLimited => "rate limited",
            Self::Api => "API error",
            Self::Malformed => "malformed response",
            Self::EmptyResponse => "empty response",
            Self::Tool => "tool failure",
            Self::Other => "error",
        };
        f.write_str(s)
    }
}

/// What the request step produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Succeeded { response: String },
    Failed { kind: FailureKind, message: String },
}

/// Summary of one harness run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub mode: Mode,
    pub outcome: Outcome,
    pub metrics: Metrics,
    pub exporters: Vec<String>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Succeeded { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self.outcome {
            Outcome::Failed { kind, .. } => Some(kind),
            Outcome::Succeeded { .. } => None,
        }
    }
}

/// Where configuration comes from for one run.
#[derive(Debug, Clone, Default)]
pub struct HarnessOptions {
    pub mode: Mode,
    pub overrides: Overrides,
    /// Optional TOML file with non-secret settings
    pub config_file: Option<PathBuf>,
    /// `.env` file to load; the usual lookup when unset
    pub env_file: Option<PathBuf>,
    /// Read variables from this map instead of the process environment.
    /// No `.env` file is loaded when set.
    pub env: Option<HashMap<String, String>>,
}

pub struct Harness {
    options: HarnessOptions,
}

impl Harness {
    pub fn new(options: HarnessOptions) -> Self {
        Self { options }
    }

    /// Run the whole verification sequence, writing operator output to `out`.
    pub async fn run<W: Write>(&mut self, out: &mut W) -> Result<RunReport, HarnessError> {
        let mode = self.options.mode;
        writeln!(out, "{RULE}")?;
        writeln!(out, "tracecheck: {mode} mode")?;
        writeln!(out, "{RULE}")?;

        // Step 1
        let config = self.load_config(out)?;
        let base_url_var = config.base_url_var();
        writeln!(out, "{base_url_var}: {}", config.base_url)?;
        writeln!(out, "LANGFUSE_HOST: {}", config.telemetry.display_host())?;
        for warning in &config.warnings {
            writeln!(out, "Warning: {warning}")?;
        }

        // Step 2
        let exporters =
            enable_exporters(ExporterRegistry::global(), &config.telemetry.exporters, out)?;

        // Step 3
        let client = LlmClient::new(&config)?;
        writeln!(out, "Model: {}", client.model())?;
        writeln!(out, "Base URL: {}", client.base_url())?;
        for name in &exporters {
            if let Some(reason) = client.catalog().unavailable_reason(name) {
                writeln!(out, "Warning: exporter '{name}' will be skipped: {reason}")?;
            } else if !client.catalog().is_available(name) {
                writeln!(out, "Warning: unknown exporter '{name}' will be skipped")?;
            }
        }

        // Step 4
        writeln!(out)?;
        let result = match mode {
            Mode::Direct => direct_request(&client, &config, out).await,
            Mode::Agent => agent_request(&client, &config, out).await,
        };
        let outcome = match result {
            Ok(response) => Outcome::Succeeded { response },
            Err(err) => {
                let kind = FailureKind::classify(&err);
                report_failure(out, kind, &err)?;
                Outcome::Failed {
                    kind,
                    message: format!("{err:#}"),
                }
            }
        };

        // Step 5
        let metrics = client.metrics();
        write_metrics(out, &metrics)?;

        // Step 6
        writeln!(out)?;
        writeln!(out, "{RULE}")?;
        writeln!(
            out,
            "Check Langfuse at {} for traces",
            config.telemetry.display_host()
        )?;
        writeln!(out, "{RULE}")?;

        info!(
            mode = %mode,
            success = matches!(outcome, Outcome::Succeeded { .. }),
            cost_usd = metrics.accumulated_cost,
            total_tokens = metrics.accumulated_total_tokens,
            "Verification run finished"
        );

        Ok(RunReport {
            mode,
            outcome,
            metrics,
            exporters,
        })
    }

    fn load_config<W: Write>(&self, out: &mut W) -> Result<HarnessConfig, HarnessError> {
        let file = self
            .options
            .config_file
            .as_deref()
            .map(FileConfig::load_from)
            .transpose()?;
        let overrides = self.options.overrides.clone();
        let mode = self.options.mode;

        let config = match &self.options.env {
            Some(env) => {
                HarnessConfig::from_lookup(mode, file, overrides, |k| env.get(k).cloned())?
            }
            None => {
                match load_dotenv(self.options.env_file.as_deref()) {
                    DotenvStatus::Loaded(path) => {
                        writeln!(out, "Loaded environment from {}", path.display())?
                    }
                    DotenvStatus::NotFound => {
                        writeln!(out, "No .env file loaded; using the process environment")?
                    }
                    DotenvStatus::Invalid { reason } => {
                        writeln!(out, "Warning: .env file not loaded: {reason}")?;
                        writeln!(out, "Using the process environment")?
                    }
                }
                HarnessConfig::load(mode, file, overrides)?
            }
        };
        Ok(config)
    }
}

/// Set the exporter switch and print the list in effect.
///
/// A switch already set to another list keeps that list; the run goes on
/// with a warning.
fn enable_exporters<W: Write>(
    registry: &ExporterRegistry,
    names: &[String],
    out: &mut W,
) -> std::io::Result<Vec<String>> {
    let exporters = match registry.set_enabled_exporters(names) {
        Ok(enabled) => enabled.to_vec(),
        Err(TelemetryError::SwitchAlreadySet { current, requested }) => {
            warn!(?current, ?requested, "Telemetry exporters were already enabled");
            writeln!(
                out,
                "Warning: exporters already enabled as {current:?}; ignoring {requested:?}"
            )?;
            current
        }
        Err(e) => {
            warn!(error = %e, "Could not enable telemetry exporters");
            Vec::new()
        }
    };
    writeln!(out, "Telemetry exporters enabled: {}", exporters.join(", "))?;
    Ok(exporters)
}

async fn direct_request<W: Write>(
    client: &LlmClient,
    config: &HarnessConfig,
    out: &mut W,
) -> anyhow::Result<String> {
    let prompt = &config.request.prompt;
    writeln!(out, "Sending: {prompt}")?;

    let metadata = RequestMetadata::default()
        .with_session(&config.request.session_id)
        .with_tags(config.request.tags.iter().cloned())
        .with_trace_name("tracecheck-direct");

    let stream = client
        .request(vec![Message::user(prompt)], metadata)
        .await
        .with_context(|| format!("request to {} failed", client.base_url()))?;
    let text = stream
        .collect_text()
        .await
        .context("reading the streamed response failed")?;

    writeln!(out, "Response: {text}")?;
    Ok(text)
}

async fn agent_request<W: Write>(
    client: &LlmClient,
    config: &HarnessConfig,
    out: &mut W,
) -> anyhow::Result<String> {
    let workspace = match &config.agent.workspace {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("cannot determine the current directory")?,
    };
    let tools = tracecheck_tools::default_registry(&workspace, &config.agent.allowed_commands)
        .with_context(|| format!("cannot use workspace {}", workspace.display()))?;
    writeln!(out, "Workspace: {}", workspace.display())?;
    writeln!(out, "Tools: {}", tools.names().join(", "))?;

    let metadata = RequestMetadata::default()
        .with_session(&config.request.session_id)
        .with_tags(config.request.tags.iter().cloned())
        .with_trace_name("tracecheck-agent");
    let mut agent = Agent::new(client.clone(), tools)
        .with_max_iterations(config.agent.max_iterations)
        .with_metadata(metadata);
    if let Some(prompt) = &config.agent.system_prompt {
        agent = agent.with_system_prompt(prompt);
    }

    let mut conversation = Conversation::new(agent, workspace);
    writeln!(out, "Instruction: {}", config.agent.instruction)?;
    conversation.submit(&config.agent.instruction);

    let outcome = conversation
        .run_to_completion()
        .await
        .context("agent run failed")?;

    writeln!(
        out,
        "Agent finished after {} model call(s), {} tool call(s) ({:?})",
        outcome.iterations, outcome.tool_calls, outcome.finish
    )?;
    if let Some(trace) = client.telemetry().get_trace(&outcome.trace_id) {
        writeln!(out, "Trace {}: {} span(s)", trace.id, trace.spans.len())?;
    }
    writeln!(out, "Response: {}", outcome.final_message)?;
    Ok(outcome.final_message)
}

fn report_failure<W: Write>(out: &mut W, kind: FailureKind, err: &anyhow::Error) -> std::io::Result<()> {
    writeln!(out)?;
    writeln!(out, "{RULE}")?;
    writeln!(out, "Request failed ({kind}): {err}")?;
    writeln!(out, "{RULE}")?;
    writeln!(out, "{err:?}")?;
    if err.backtrace().status() == BacktraceStatus::Captured {
        writeln!(out, "\nBacktrace:\n{}", err.backtrace())?;
    }
    Ok(())
}

fn write_metrics<W: Write>(out: &mut W, m: &Metrics) -> std::io::Result<()> {
    writeln!(out)?;
    writeln!(out, "Usage metrics:")?;
    writeln!(out, "  Accumulated cost:   ${:.6}", m.accumulated_cost)?;
    writeln!(out, "  Input tokens:       {}", m.accumulated_input_tokens)?;
    writeln!(out, "  Output tokens:      {}", m.accumulated_output_tokens)?;
    writeln!(out, "  Total tokens:       {}", m.accumulated_total_tokens)?;
    writeln!(out, "  Requests:           {}", m.request_count)?;
    Ok(())
}

/// Process exit code for a finished run.
///
/// Outside strict mode only configuration errors are non-zero. In strict
/// mode a configuration error is 2 and a failed request is 1.
pub fn exit_code(result: &Result<RunReport, HarnessError>, strict: bool) -> u8 {
    match result {
        Ok(report) if report.is_success() || !strict => 0,
        Ok(_) => 1,
        Err(_) if strict => 2,
        Err(_) => 1,
    }
}
