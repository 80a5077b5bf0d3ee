//! Workspace scoping for the file and terminal tools.
//!
//! Every path a tool touches must resolve inside the workspace root. Relative
//! paths are taken against the root; absolute paths must already point
//! inside it.

use std::path::{Component, Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum PathValidationError {
    #[error("Path '{path}' is outside the workspace")]
    OutsideWorkspace { path: String },

    #[error("Path traversal detected in '{path}'")]
    PathTraversal { path: String },

    #[error("Failed to canonicalize path '{path}': {reason}")]
    CanonicalizeFailed { path: String, reason: String },
}

/// A canonical workspace root.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Canonicalize `root`; the directory must exist.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, PathValidationError> {
        let root = root.as_ref();
        let canonical = root
            .canonicalize()
            .map_err(|e| PathValidationError::CanonicalizeFailed {
                path: root.display().to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self { root: canonical })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a tool-supplied path to an absolute path inside the root.
    ///
    /// The target itself need not exist (for `create`), but the deepest
    /// entry that does exist, symlink or not, is resolved before the
    /// containment check. A dangling symlink cannot be resolved and is
    /// refused.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, PathValidationError> {
        let raw = Path::new(path);
        if raw.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(PathValidationError::PathTraversal { path: path.into() });
        }

        let joined = if raw.is_absolute() {
            raw.to_path_buf()
        } else {
            self.root.join(raw)
        };

        // Canonicalize the deepest existing entry, then re-append the rest.
        // `symlink_metadata` sees links whose target is missing.
        let mut existing = joined.as_path();
        let mut rest = Vec::new();
        while existing.symlink_metadata().is_err() {
            match (existing.parent(), existing.file_name()) {
                (Some(parent), Some(name)) => {
                    rest.push(name.to_os_string());
                    existing = parent;
                }
                _ => break,
            }
        }
        let mut canonical =
            existing
                .canonicalize()
                .map_err(|e| PathValidationError::CanonicalizeFailed {
                    path: path.into(),
                    reason: e.to_string(),
                })?;
        for name in rest.into_iter().rev() {
            canonical.push(name);
        }

        if !canonical.starts_with(&self.root) {
            return Err(PathValidationError::OutsideWorkspace { path: path.into() });
        }
        Ok(canonical)
    }

    /// Path relative to the root, for display in tool output.
    pub fn display(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .map(|p| {
                if p.as_os_str().is_empty() {
                    ".".to_string()
                } else {
                    p.display().to_string()
                }
            })
            .unwrap_or_else(|_| path.display().to_string())
    }
}
