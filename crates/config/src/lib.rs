//! Configuration loading and validation for tracecheck.
//!
//! Settings come from three layers, lowest priority first:
//! an optional TOML file, the process environment (after an optional `.env`
//! file has been merged into it), and command-line overrides. Secrets are
//! only ever read from the environment.
//!
//! Required keys (`<PROVIDER>_API_KEY`, `<PROVIDER>_BASE_URL`) must be present
//! before a client is built; a missing one is a fatal [`ConfigError`] that
//! names the key. Missing optional keys degrade to defaults and are recorded
//! in [`HarnessConfig::warnings`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Provider prefix used when nothing else selects one.
pub const DEFAULT_PROVIDER: &str = "ZAI";
/// Model used in direct mode when `LLM_MODEL` is unset.
pub const DEFAULT_DIRECT_MODEL: &str = "glm-4.7";
/// Model used in agent mode when `LLM_MODEL` is unset.
pub const DEFAULT_AGENT_MODEL: &str = "anthropic/glm-4.7";
/// Shown in place of an unset telemetry host.
pub const HOST_PLACEHOLDER: &str = "<not set>";
pub const DEFAULT_EXPORTER: &str = "langfuse";
pub const DEFAULT_SESSION_ID: &str = "test_session_001";
pub const DEFAULT_USAGE_ID: &str = "test_langfuse_integration";

pub const ENV_PROVIDER: &str = "TRACECHECK_PROVIDER";
pub const ENV_EXPORTERS: &str = "TRACECHECK_EXPORTERS";
pub const ENV_MODEL: &str = "LLM_MODEL";
pub const ENV_LANGFUSE_HOST: &str = "LANGFUSE_HOST";
pub const ENV_LANGFUSE_PUBLIC_KEY: &str = "LANGFUSE_PUBLIC_KEY";
pub const ENV_LANGFUSE_SECRET_KEY: &str = "LANGFUSE_SECRET_KEY";

/// Which request path the harness exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// One streamed chat request issued by the harness itself
    #[default]
    Direct,
    /// One instruction driven through the agent/tool loop
    Agent,
}

impl Mode {
    pub fn default_model(&self) -> &'static str {
        match self {
            Mode::Direct => DEFAULT_DIRECT_MODEL,
            Mode::Agent => DEFAULT_AGENT_MODEL,
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Direct => f.write_str("direct"),
            Mode::Agent => f.write_str("agent"),
        }
    }
}

/// Fully resolved harness configuration.
#[derive(Clone, Serialize)]
pub struct HarnessConfig {
    pub mode: Mode,

    /// Environment prefix of the model provider, e.g. `ZAI`
    pub provider: String,

    #[serde(skip_serializing)]
    pub api_key: String,

    pub base_url: String,

    /// Model id, optionally prefixed with a wire format (`anthropic/…`)
    pub model: String,

    /// Label attached to every trace emitted by the client
    pub usage_id: String,

    pub telemetry: TelemetryConfig,

    pub request: RequestConfig,

    pub agent: AgentConfig,

    /// Human-readable notes about optional keys that fell back to defaults
    #[serde(skip)]
    pub warnings: Vec<String>,
}

/// Telemetry forwarding settings.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Backend UI / ingestion host; `None` when `LANGFUSE_HOST` is unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(skip)]
    pub public_key: Option<String>,

    #[serde(skip)]
    pub secret_key: Option<String>,

    /// Exporter names for the process-wide switch
    #[serde(default)]
    pub exporters: Vec<String>,

    /// Per-million-token pricing overrides, keyed by model name
    #[serde(default)]
    pub custom_pricing: HashMap<String, PricingOverrideConfig>,
}

impl TelemetryConfig {
    /// Host for display, falling back to the placeholder.
    pub fn display_host(&self) -> &str {
        self.host.as_deref().unwrap_or(HOST_PLACEHOLDER)
    }
}

/// Custom per-million-token pricing for a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingOverrideConfig {
    pub input_per_m: f64,
    pub output_per_m: f64,
}

/// Settings for the direct-mode request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    #[serde(default = "default_session_id")]
    pub session_id: String,

    #[serde(default = "default_tags")]
    pub tags: Vec<String>,

    #[serde(default = "default_prompt")]
    pub prompt: String,
}

fn default_session_id() -> String {
    DEFAULT_SESSION_ID.into()
}
fn default_tags() -> Vec<String> {
    vec!["test".into(), "langfuse-integration".into()]
}
fn default_prompt() -> String {
    "Say 'Hello from tracecheck with Langfuse!'".into()
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            session_id: default_session_id(),
            tags: default_tags(),
            prompt: default_prompt(),
        }
    }
}

/// Settings for agent mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_instruction")]
    pub instruction: String,

    /// Working directory for terminal and file tools; current dir when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,

    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Replaces the built-in agent system prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Programs the terminal tool may run; empty allows any
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_commands: Vec<String>,
}

fn default_instruction() -> String {
    "Say 'Hello from tracecheck with Langfuse!' Keep it brief.".into()
}
fn default_max_iterations() -> u32 {
    10
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            instruction: default_instruction(),
            workspace: None,
            max_iterations: default_max_iterations(),
            system_prompt: None,
            allowed_commands: Vec::new(),
        }
    }
}

/// Non-secret settings read from an optional TOML file.
///
/// ```toml
/// provider = "ZAI"
/// model = "glm-4.7"
///
/// [telemetry]
/// exporters = ["langfuse", "log"]
///
/// [request]
/// session_id = "nightly"
/// tags = ["ci"]
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub provider: Option<String>,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub usage_id: Option<String>,

    #[serde(default)]
    pub telemetry: Option<FileTelemetryConfig>,

    #[serde(default)]
    pub request: Option<RequestConfig>,

    #[serde(default)]
    pub agent: Option<AgentConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileTelemetryConfig {
    #[serde(default)]
    pub exporters: Vec<String>,

    #[serde(default)]
    pub custom_pricing: HashMap<String, PricingOverrideConfig>,
}

impl FileConfig {
    /// Read a TOML settings file. A missing file is an error here: the
    /// operator asked for it explicitly.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

/// Command-line overrides, applied last.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub session_id: Option<String>,
    pub tags: Vec<String>,
    pub exporters: Vec<String>,
    pub prompt: Option<String>,
    pub workspace: Option<PathBuf>,
}

/// What [`load_dotenv`] found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DotenvStatus {
    Loaded(PathBuf),
    /// No `.env` file on the usual lookup path
    NotFound,
    /// A file was named or found but could not be loaded
    Invalid { reason: String },
}

/// Merge a `.env` file into the process environment.
///
/// With `path = None` the usual `.env` lookup (current dir and parents) is
/// used, and finding nothing is not an error. An explicitly named file that
/// is missing, or any file that fails to parse, is reported as
/// [`DotenvStatus::Invalid`]. Existing variables win over file entries.
pub fn load_dotenv(path: Option<&Path>) -> DotenvStatus {
    let result = match path {
        Some(p) => dotenvy::from_path(p).map(|()| p.to_path_buf()),
        None => dotenvy::dotenv(),
    };
    match result {
        Ok(loaded) => {
            tracing::debug!(path = %loaded.display(), "Loaded .env file");
            DotenvStatus::Loaded(loaded)
        }
        Err(e) if e.not_found() && path.is_none() => {
            tracing::debug!(error = %e, "No .env file loaded");
            DotenvStatus::NotFound
        }
        Err(e) => {
            let reason = match path {
                Some(p) => format!("{}: {e}", p.display()),
                None => e.to_string(),
            };
            tracing::warn!(reason = %reason, ".env file could not be loaded");
            DotenvStatus::Invalid { reason }
        }
    }
}

impl HarnessConfig {
    /// Resolve configuration from the process environment.
    pub fn load(
        mode: Mode,
        file: Option<FileConfig>,
        overrides: Overrides,
    ) -> Result<Self, ConfigError> {
        Self::from_lookup(mode, file, overrides, |key| std::env::var(key).ok())
    }

    /// Resolve configuration using `lookup` in place of the environment.
    pub fn from_lookup<F>(
        mode: Mode,
        file: Option<FileConfig>,
        overrides: Overrides,
        lookup: F,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Treat empty values the same as absent ones.
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let file = file.unwrap_or_default();
        let mut warnings = Vec::new();

        let provider = overrides
            .provider
            .or_else(|| get(ENV_PROVIDER))
            .or(file.provider)
            .map(|p| normalize_prefix(&p))
            .unwrap_or_else(|| DEFAULT_PROVIDER.into());

        let key_var = format!("{provider}_API_KEY");
        let url_var = format!("{provider}_BASE_URL");
        let api_key = get(&key_var).ok_or(ConfigError::MissingKey { key: key_var })?;
        let base_url = get(&url_var).ok_or(ConfigError::MissingKey { key: url_var })?;

        let model = match overrides.model.or_else(|| get(ENV_MODEL)).or(file.model) {
            Some(m) => m,
            None => {
                let fallback = mode.default_model();
                warnings.push(format!("{ENV_MODEL} not set, using default model '{fallback}'"));
                fallback.to_string()
            }
        };

        let host = get(ENV_LANGFUSE_HOST);
        if host.is_none() {
            warnings.push(format!(
                "{ENV_LANGFUSE_HOST} not set, showing '{HOST_PLACEHOLDER}'"
            ));
        }

        let file_telemetry = file.telemetry.unwrap_or_default();
        let exporters = if !overrides.exporters.is_empty() {
            overrides.exporters
        } else if let Some(list) = get(ENV_EXPORTERS) {
            split_list(&list)
        } else if !file_telemetry.exporters.is_empty() {
            file_telemetry.exporters
        } else {
            vec![DEFAULT_EXPORTER.into()]
        };

        let mut request = file.request.unwrap_or_default();
        if let Some(session_id) = overrides.session_id {
            request.session_id = session_id;
        }
        if !overrides.tags.is_empty() {
            request.tags = overrides.tags;
        } else if request.tags == default_tags() {
            // Default labels also name the provider, e.g. `zai`.
            request.tags.push(provider.to_ascii_lowercase());
        }

        let mut agent = file.agent.unwrap_or_default();
        if let Some(workspace) = overrides.workspace {
            agent.workspace = Some(workspace);
        }

        // One prompt flag serves both modes.
        if let Some(prompt) = overrides.prompt {
            match mode {
                Mode::Direct => request.prompt = prompt,
                Mode::Agent => agent.instruction = prompt,
            }
        }

        for w in &warnings {
            tracing::debug!(warning = %w, "Optional configuration fell back to default");
        }

        let config = Self {
            mode,
            provider,
            api_key,
            base_url,
            model,
            usage_id: file.usage_id.unwrap_or_else(|| DEFAULT_USAGE_ID.into()),
            telemetry: TelemetryConfig {
                host,
                public_key: get(ENV_LANGFUSE_PUBLIC_KEY),
                secret_key: get(ENV_LANGFUSE_SECRET_KEY),
                exporters,
                custom_pricing: file_telemetry.custom_pricing,
            },
            request,
            agent,
            warnings,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.model.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: ENV_MODEL.into(),
                reason: "model identifier is empty".into(),
            });
        }
        if self.mode == Mode::Agent
            && let Some(dir) = &self.agent.workspace
            && !dir.is_dir()
        {
            return Err(ConfigError::InvalidValue {
                key: "agent.workspace".into(),
                reason: format!("{} is not a directory", dir.display()),
            });
        }
        if self.agent.max_iterations == 0 {
            return Err(ConfigError::InvalidValue {
                key: "agent.max_iterations".into(),
                reason: "must be at least 1".into(),
            });
        }
        for (model, p) in &self.telemetry.custom_pricing {
            if p.input_per_m < 0.0 || p.output_per_m < 0.0 {
                return Err(ConfigError::InvalidValue {
                    key: format!("telemetry.custom_pricing.{model}"),
                    reason: "prices must not be negative".into(),
                });
            }
        }
        Ok(())
    }

    /// Name of the environment variable holding the credential.
    pub fn api_key_var(&self) -> String {
        format!("{}_API_KEY", self.provider)
    }

    /// Name of the environment variable holding the endpoint URL.
    pub fn base_url_var(&self) -> String {
        format!("{}_BASE_URL", self.provider)
    }
}

fn normalize_prefix(raw: &str) -> String {
    raw.trim().to_ascii_uppercase().replace('-', "_")
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Redact a secret for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for HarnessConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarnessConfig")
            .field("mode", &self.mode)
            .field("provider", &self.provider)
            .field("api_key", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("usage_id", &self.usage_id)
            .field("telemetry", &self.telemetry)
            .field("request", &self.request)
            .field("agent", &self.agent)
            .finish()
    }
}

impl std::fmt::Debug for TelemetryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryConfig")
            .field("host", &self.host)
            .field("public_key", &redact(&self.public_key))
            .field("secret_key", &redact(&self.secret_key))
            .field("exporters", &self.exporters)
            .field("custom_pricing", &self.custom_pricing)
            .finish()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration key: {key}")]
    MissingKey { key: String },

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },
}
