//! The agent: a client bound to a tool set.

use tracecheck_core::provider::RequestMetadata;
use tracecheck_core::tool::ToolRegistry;
use tracecheck_providers::LlmClient;

/// Tool-call rounds allowed per run unless configured otherwise.
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

const DEFAULT_TRACE_NAME: &str = "tracecheck-agent";

const SYSTEM_PROMPT: &str = "You are a careful software agent. You can run shell commands with \
the `terminal` tool, read and edit files with `file_editor`, and keep a plan with \
`task_tracker`. Use tools only when the task needs them. When the task is done, reply with \
a short final answer and no tool calls.";

/// A model client plus the tools it may call.
pub struct Agent {
    pub(crate) client: LlmClient,
    pub(crate) tools: ToolRegistry,
    pub(crate) system_prompt: String,
    pub(crate) max_iterations: u32,
    pub(crate) metadata: RequestMetadata,
}

impl Agent {
    pub fn new(client: LlmClient, tools: ToolRegistry) -> Self {
        Self {
            client,
            tools,
            system_prompt: SYSTEM_PROMPT.to_string(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            metadata: RequestMetadata::default().with_trace_name(DEFAULT_TRACE_NAME),
        }
    }

    /// Set the maximum number of model calls per run. Zero is treated as one.
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max.max(1);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Labels for the trace each run produces.
    pub fn with_metadata(mut self, metadata: RequestMetadata) -> Self {
        self.metadata = metadata;
        if self.metadata.trace_name.is_none() {
            self.metadata.trace_name = Some(DEFAULT_TRACE_NAME.to_string());
        }
        self
    }

    pub fn client(&self) -> &LlmClient {
        &self.client
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("client", &self.client)
            .field("tools", &self.tools.names())
            .field("max_iterations", &self.max_iterations)
            .finish()
    }
}
