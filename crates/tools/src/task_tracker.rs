//! Task tracker tool: an in-memory plan the agent keeps while it works.
//!
//! `plan` replaces the whole list; `view` renders it. Nothing is persisted.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use tracecheck_core::error::ToolError;
use tracecheck_core::tool::{Tool, ToolResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Done,
}

impl TaskStatus {
    fn marker(self) -> &'static str {
        match self {
            Self::Todo => "[ ]",
            Self::InProgress => "[~]",
            Self::Done => "[x]",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub title: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum TrackerCommand {
    View,
    Plan { task_list: Vec<Task> },
}

#[derive(Default)]
pub struct TaskTrackerTool {
    tasks: RwLock<Vec<Task>>,
}

impl TaskTrackerTool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.tasks.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn render(tasks: &[Task]) -> String {
        if tasks.is_empty() {
            return "No tasks planned.".into();
        }
        let done = tasks.iter().filter(|t| t.status == TaskStatus::Done).count();
        let mut out = format!("{done}/{} tasks done\n", tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            out.push_str(&format!("{}. {} {}", i + 1, task.status.marker(), task.title));
            if let Some(notes) = &task.notes {
                out.push_str(&format!(" ({notes})"));
            }
            out.push('\n');
        }
        out.trim_end().to_string()
    }
}

#[async_trait]
impl Tool for TaskTrackerTool {
    fn name(&self) -> &str {
        "task_tracker"
    }

    fn description(&self) -> &str {
        "Track a task plan. `plan` replaces the task list, `view` shows it with each task's status."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "enum": ["view", "plan"] },
                "task_list": {
                    "type": "array",
                    "description": "Full task list for `plan`",
                    "items": {
                        "type": "object",
                        "properties": {
                            "title": { "type": "string" },
                            "status": { "type": "string", "enum": ["todo", "in_progress", "done"] },
                            "notes": { "type": "string" }
                        },
                        "required": ["title"]
                    }
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let command: TrackerCommand = serde_json::from_value(arguments)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;

        match command {
            TrackerCommand::View => Ok(ToolResult::ok(Self::render(&self.tasks()))),
            TrackerCommand::Plan { task_list } => {
                if let Some(blank) = task_list.iter().position(|t| t.title.trim().is_empty()) {
                    return Err(ToolError::InvalidArguments(format!(
                        "task {} has an empty title",
                        blank + 1
                    )));
                }
                let rendered = Self::render(&task_list);
                *self.tasks.write().unwrap_or_else(|e| e.into_inner()) = task_list;
                Ok(ToolResult::ok(rendered))
            }
        }
    }
}
