//! File editor tool: view, create and edit files inside the workspace.
//!
//! One tool with a `command` argument: `view`, `create`, `str_replace`,
//! `insert` and `undo_edit`. Edits keep a per-file history in memory so the
//! last change can be undone.

use crate::path::Workspace;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tracecheck_core::error::ToolError;
use tracecheck_core::tool::{Tool, ToolResult};
use tracing::debug;

const MAX_DIR_ENTRIES: usize = 200;

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum EditCommand {
    View {
        path: String,
        #[serde(default)]
        view_range: Option<[i64; 2]>,
    },
    Create {
        path: String,
        file_text: String,
    },
    StrReplace {
        path: String,
        old_str: String,
        #[serde(default)]
        new_str: String,
    },
    Insert {
        path: String,
        insert_line: usize,
        new_str: String,
    },
    UndoEdit {
        path: String,
    },
}

pub struct FileEditorTool {
    workspace: Workspace,
    history: Mutex<HashMap<PathBuf, Vec<String>>>,
}

impl FileEditorTool {
    pub fn new(workspace: Workspace) -> Self {
        Self {
            workspace,
            history: Mutex::new(HashMap::new()),
        }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, ToolError> {
        self.workspace
            .resolve(path)
            .map_err(|e| ToolError::PermissionDenied {
                tool_name: "file_editor".into(),
                reason: e.to_string(),
            })
    }

    fn remember(&self, path: &Path, previous: String) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.entry(path.to_path_buf()).or_default().push(previous);
    }

    async fn view(&self, path: &Path, range: Option<[i64; 2]>) -> ToolResult {
        let shown = self.workspace.display(path);
        if path.is_dir() {
            return match list_dir(path).await {
                Ok(entries) => ToolResult::ok(format!("Directory {shown}:\n{}", entries.join("\n"))),
                Err(e) => ToolResult::failed(format!("Failed to list {shown}: {e}")),
            };
        }

        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) => return ToolResult::failed(format!("Failed to read {shown}: {e}")),
        };
        let lines: Vec<&str> = content.lines().collect();

        let (start, end) = match range {
            None => (1, lines.len()),
            Some([start, end]) => {
                let end = if end == -1 { lines.len() as i64 } else { end };
                if start < 1 || end < start || end as usize > lines.len() {
                    return ToolResult::failed(format!(
                        "Invalid view_range [{start}, {end}] for {shown} ({} lines)",
                        lines.len()
                    ));
                }
                (start as usize, end as usize)
            }
        };

        let numbered: Vec<String> = lines
            .iter()
            .enumerate()
            .skip(start.saturating_sub(1))
            .take((end + 1).saturating_sub(start))
            .map(|(i, line)| format!("{:6}\t{line}", i + 1))
            .collect();
        ToolResult::ok(format!("File {shown}:\n{}", numbered.join("\n")))
    }

    async fn create(&self, path: &Path, text: &str) -> ToolResult {
        let shown = self.workspace.display(path);
        if path.exists() {
            return ToolResult::failed(format!(
                "{shown} already exists; use str_replace or insert to edit it"
            ));
        }
        if let Some(parent) = path.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            return ToolResult::failed(format!("Failed to create directory: {e}"));
        }
        // `create_new` refuses anything already at the path, links included.
        let written = async {
            let mut file = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .await?;
            file.write_all(text.as_bytes()).await?;
            file.flush().await
        };
        match written.await {
            Ok(()) => ToolResult::ok(format!("Created {shown} ({} bytes)", text.len())),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => ToolResult::failed(format!(
                "{shown} already exists; use str_replace or insert to edit it"
            )),
            Err(e) => ToolResult::failed(format!("Failed to write {shown}: {e}")),
        }
    }

    async fn str_replace(&self, path: &Path, old: &str, new: &str) -> ToolResult {
        let shown = self.workspace.display(path);
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) => return ToolResult::failed(format!("Failed to read {shown}: {e}")),
        };
        if old.is_empty() {
            return ToolResult::failed("old_str must not be empty");
        }
        match content.matches(old).count() {
            0 => return ToolResult::failed(format!("old_str not found in {shown}")),
            1 => {}
            n => {
                return ToolResult::failed(format!(
                    "old_str occurs {n} times in {shown}; make it unique"
                ));
            }
        }
        let updated = content.replacen(old, new, 1);
        self.write_edit(path, content, &updated, &shown).await
    }

    async fn insert(&self, path: &Path, after: usize, text: &str) -> ToolResult {
        let shown = self.workspace.display(path);
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) => return ToolResult::failed(format!("Failed to read {shown}: {e}")),
        };
        let mut lines: Vec<&str> = content.lines().collect();
        if after > lines.len() {
            return ToolResult::failed(format!(
                "insert_line {after} is past the end of {shown} ({} lines)",
                lines.len()
            ));
        }
        for (offset, line) in text.lines().enumerate() {
            lines.insert(after + offset, line);
        }
        let mut updated = lines.join("\n");
        if content.ends_with('\n') || content.is_empty() {
            updated.push('\n');
        }
        self.write_edit(path, content.clone(), &updated, &shown).await
    }

    async fn undo(&self, path: &Path) -> ToolResult {
        let shown = self.workspace.display(path);
        let previous = {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            history.get_mut(path).and_then(Vec::pop)
        };
        let Some(previous) = previous else {
            return ToolResult::failed(format!("No edit history for {shown}"));
        };
        match tokio::fs::write(path, &previous).await {
            Ok(()) => ToolResult::ok(format!("Reverted last edit to {shown}")),
            Err(e) => ToolResult::failed(format!("Failed to write {shown}: {e}")),
        }
    }

    async fn write_edit(&self, path: &Path, previous: String, updated: &str, shown: &str) -> ToolResult {
        match tokio::fs::write(path, updated).await {
            Ok(()) => {
                self.remember(path, previous);
                ToolResult::ok(format!("Edited {shown}"))
            }
            Err(e) => ToolResult::failed(format!("Failed to write {shown}: {e}")),
        }
    }
}

async fn list_dir(path: &Path) -> std::io::Result<Vec<String>> {
    let mut entries = Vec::new();
    let mut dir = tokio::fs::read_dir(path).await?;
    while let Some(entry) = dir.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        entries.push(if is_dir { format!("{name}/") } else { name });
    }
    entries.sort();
    entries.truncate(MAX_DIR_ENTRIES);
    Ok(entries)
}

#[async_trait]
impl Tool for FileEditorTool {
    fn name(&self) -> &str {
        "file_editor"
    }

    fn description(&self) -> &str {
        "View, create and edit files in the workspace. Commands: view (file or directory), \
         create (new file), str_replace (replace one unique occurrence), insert (after a line \
         number, 0 for the top) and undo_edit."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "enum": ["view", "create", "str_replace", "insert", "undo_edit"]
                },
                "path": {
                    "type": "string",
                    "description": "File or directory path, relative to the workspace"
                },
                "file_text": { "type": "string", "description": "Content for `create`" },
                "old_str": { "type": "string", "description": "Exact text to replace" },
                "new_str": { "type": "string", "description": "Replacement or inserted text" },
                "insert_line": { "type": "integer", "description": "Insert after this line" },
                "view_range": {
                    "type": "array",
                    "items": { "type": "integer" },
                    "description": "[start, end] lines for `view`; end -1 means last line"
                }
            },
            "required": ["command", "path"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let command: EditCommand = serde_json::from_value(arguments)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        debug!(?command, "file_editor");

        Ok(match command {
            EditCommand::View { path, view_range } => {
                let path = self.resolve(&path)?;
                self.view(&path, view_range).await
            }
            EditCommand::Create { path, file_text } => {
                let path = self.resolve(&path)?;
                self.create(&path, &file_text).await
            }
            EditCommand::StrReplace {
                path,
                old_str,
                new_str,
            } => {
                let path = self.resolve(&path)?;
                self.str_replace(&path, &old_str, &new_str).await
            }
            EditCommand::Insert {
                path,
                insert_line,
                new_str,
            } => {
                let path = self.resolve(&path)?;
                self.insert(&path, insert_line, &new_str).await
            }
            EditCommand::UndoEdit { path } => {
                let path = self.resolve(&path)?;
                self.undo(&path).await
            }
        })
    }
}
