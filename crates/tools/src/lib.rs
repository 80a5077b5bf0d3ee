//! Built-in tools for the tracecheck agent.
//!
//! The agent gets exactly three capabilities, all confined to one
//! workspace directory: a terminal, a file editor and a task tracker.

pub mod file_editor;
pub mod path;
pub mod task_tracker;
pub mod terminal;

pub use file_editor::FileEditorTool;
pub use path::{PathValidationError, Workspace};
pub use task_tracker::{Task, TaskStatus, TaskTrackerTool};
pub use terminal::TerminalTool;

use std::path::Path;
use tracecheck_core::tool::ToolRegistry;

/// Registry with the terminal, file editor and task tracker bound to
/// `workspace`. A non-empty `allowed_commands` limits the terminal to those
/// programs.
pub fn default_registry(
    workspace: &Path,
    allowed_commands: &[String],
) -> Result<ToolRegistry, PathValidationError> {
    let workspace = Workspace::new(workspace)?;
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(
        TerminalTool::new(workspace.clone()).with_allowlist(allowed_commands.to_vec()),
    ));
    registry.register(Box::new(FileEditorTool::new(workspace)));
    registry.register(Box::new(TaskTrackerTool::new()));
    Ok(registry)
}
