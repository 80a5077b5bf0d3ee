//! Terminal tool: run a shell command in the workspace.
//!
//! Commands run through `sh -c` (`cmd /C` on Windows) with the workspace as
//! working directory, a timeout, and an optional first-word allowlist.

use crate::path::Workspace;
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tracecheck_core::error::ToolError;
use tracecheck_core::tool::{Tool, ToolResult};
use tracing::{debug, warn};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Output beyond this many bytes is cut off before it reaches the model.
const MAX_OUTPUT_BYTES: usize = 16 * 1024;

pub struct TerminalTool {
    workspace: Workspace,
    timeout: Duration,
    /// If non-empty, only these commands are allowed.
    allowed_commands: Vec<String>,
}

impl TerminalTool {
    pub fn new(workspace: Workspace) -> Self {
        Self {
            workspace,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            allowed_commands: Vec::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_allowlist(mut self, commands: Vec<String>) -> Self {
        self.allowed_commands = commands;
        self
    }

    fn is_command_allowed(&self, command: &str) -> bool {
        if self.allowed_commands.is_empty() {
            return true;
        }
        let base_cmd = command.split_whitespace().next().unwrap_or("");
        self.allowed_commands.iter().any(|a| a == base_cmd)
    }
}

#[async_trait]
impl Tool for TerminalTool {
    fn name(&self) -> &str {
        "terminal"
    }

    fn description(&self) -> &str {
        "Run a shell command in the workspace directory and return its stdout and stderr."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let command = arguments["command"]
            .as_str()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'command' argument".into()))?;

        if !self.is_command_allowed(command) {
            return Err(ToolError::PermissionDenied {
                tool_name: "terminal".into(),
                reason: format!(
                    "Command '{}' not in allowlist",
                    command.split_whitespace().next().unwrap_or("")
                ),
            });
        }

        debug!(command = %command, cwd = %self.workspace.root().display(), "Running command");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.current_dir(self.workspace.root()).kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ToolError::ExecutionFailed {
                    tool_name: "terminal".into(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(ToolError::Timeout {
                    tool_name: "terminal".into(),
                    timeout_secs: self.timeout.as_secs(),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let success = output.status.success();

        let text = if success {
            if stderr.is_empty() {
                stdout.to_string()
            } else {
                format!("{stdout}\n[stderr]: {stderr}")
            }
        } else {
            let code = output.status.code().unwrap_or(-1);
            warn!(command = %command, exit_code = code, "Command failed");
            format!("[exit code: {code}]\n{stdout}\n{stderr}")
        };

        let text = truncate(text.trim());
        Ok(if success {
            ToolResult::ok(text)
        } else {
            ToolResult::failed(text)
        })
    }
}

fn truncate(text: &str) -> String {
    if text.len() <= MAX_OUTPUT_BYTES {
        return text.to_string();
    }
    let mut end = MAX_OUTPUT_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[output truncated, {} bytes total]", &text[..end], text.len())
}
