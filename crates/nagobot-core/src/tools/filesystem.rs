use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{Tool, ToolResult};

/// Resolve a path, expanding `~` and enforcing the optional sandbox directory.
fn resolve_path(path: &str, allowed_dir: Option<&Path>) -> std::result::Result<PathBuf, String> {
    let expanded = expand_home(path);

    let resolved = expanded
        .canonicalize()
        .unwrap_or_else(|_| std::path::absolute(&expanded).unwrap_or(expanded));

    check_sandbox(path, &resolved, allowed_dir)?;
    Ok(resolved)
}

/// Resolve a path for write operations (the target may not exist yet).
fn resolve_path_for_write(
    path: &str,
    allowed_dir: Option<&Path>,
) -> std::result::Result<PathBuf, String> {
    let expanded = expand_home(path);
    let resolved = std::path::absolute(&expanded).unwrap_or(expanded);

    check_sandbox(path, &resolved, allowed_dir)?;
    Ok(resolved)
}

fn expand_home(path: &str) -> PathBuf {
    if path.starts_with("~/") || path == "~" {
        dirs::home_dir()
            .map(|h| h.join(path.strip_prefix("~/").unwrap_or("")))
            .unwrap_or_else(|| PathBuf::from(path))
    } else {
        PathBuf::from(path)
    }
}

fn check_sandbox(
    original: &str,
    resolved: &Path,
    allowed_dir: Option<&Path>,
) -> std::result::Result<(), String> {
    if let Some(allowed) = allowed_dir {
        let allowed_resolved = allowed
            .canonicalize()
            .unwrap_or_else(|_| allowed.to_path_buf());
        if !resolved.starts_with(&allowed_resolved) {
            return Err(format!(
                "Path {original} is outside allowed directory {}",
                allowed.display()
            ));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// read_file
// ---------------------------------------------------------------------------

pub struct ReadFileTool {
    allowed_dir: Option<PathBuf>,
}

impl ReadFileTool {
    pub fn new(allowed_dir: Option<PathBuf>) -> Self {
        Self { allowed_dir }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file at the given path."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The file path to read"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(
        &self,
        _token: &CancellationToken,
        params: serde_json::Value,
    ) -> Result<ToolResult> {
        let path = params
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: path"))?;

        let file_path = match resolve_path(path, self.allowed_dir.as_deref()) {
            Ok(p) => p,
            Err(e) => return Ok(ToolResult::text(format!("Error: {e}"))),
        };

        if !file_path.exists() {
            return Ok(ToolResult::text(format!("Error: File not found: {path}")));
        }
        if !file_path.is_file() {
            return Ok(ToolResult::text(format!("Error: Not a file: {path}")));
        }

        match std::fs::read_to_string(&file_path) {
            Ok(content) => {
                const MAX_LEN: usize = 50_000;
                if content.len() > MAX_LEN {
                    let mut end = MAX_LEN;
                    while end > 0 && !content.is_char_boundary(end) {
                        end -= 1;
                    }
                    Ok(ToolResult::text(format!(
                        "{}\n... (truncated, {} more chars)",
                        &content[..end],
                        content.len() - end
                    )))
                } else {
                    Ok(ToolResult::text(content))
                }
            }
            Err(e) => Ok(ToolResult::text(format!("Error reading file: {e}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// write_file
// ---------------------------------------------------------------------------

pub struct WriteFileTool {
    allowed_dir: Option<PathBuf>,
}

impl WriteFileTool {
    pub fn new(allowed_dir: Option<PathBuf>) -> Self {
        Self { allowed_dir }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file at the given path. Creates parent directories if needed."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The file path to write to"
                },
                "content": {
                    "type": "string",
                    "description": "The content to write"
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(
        &self,
        _token: &CancellationToken,
        params: serde_json::Value,
    ) -> Result<ToolResult> {
        let path = params
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: path"))?;
        let content = params
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: content"))?;

        let file_path = match resolve_path_for_write(path, self.allowed_dir.as_deref()) {
            Ok(p) => p,
            Err(e) => return Ok(ToolResult::text(format!("Error: {e}"))),
        };

        if let Some(parent) = file_path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                return Ok(ToolResult::text(format!("Error creating directories: {e}")));
            }
        }
        match std::fs::write(&file_path, content) {
            Ok(()) => Ok(ToolResult::text(format!(
                "Successfully wrote {} bytes to {path}",
                content.len()
            ))),
            Err(e) => Ok(ToolResult::text(format!("Error writing file: {e}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// edit_file
// ---------------------------------------------------------------------------

pub struct EditFileTool {
    allowed_dir: Option<PathBuf>,
}

impl EditFileTool {
    pub fn new(allowed_dir: Option<PathBuf>) -> Self {
        Self { allowed_dir }
    }
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Edit a file by replacing old_text with new_text. The old_text must exist exactly once in the file."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The file path to edit"
                },
                "old_text": {
                    "type": "string",
                    "description": "The exact text to find and replace"
                },
                "new_text": {
                    "type": "string",
                    "description": "The text to replace with"
                }
            },
            "required": ["path", "old_text", "new_text"]
        })
    }

    async fn execute(
        &self,
        _token: &CancellationToken,
        params: serde_json::Value,
    ) -> Result<ToolResult> {
        let path = params
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: path"))?;
        let old_text = params
            .get("old_text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: old_text"))?;
        let new_text = params
            .get("new_text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: new_text"))?;

        let file_path = match resolve_path(path, self.allowed_dir.as_deref()) {
            Ok(p) => p,
            Err(e) => return Ok(ToolResult::text(format!("Error: {e}"))),
        };

        if !file_path.exists() {
            return Ok(ToolResult::text(format!("Error: File not found: {path}")));
        }

        let content = match std::fs::read_to_string(&file_path) {
            Ok(c) => c,
            Err(e) => return Ok(ToolResult::text(format!("Error reading file: {e}"))),
        };

        if !content.contains(old_text) {
            return Ok(ToolResult::text(
                "Error: old_text not found in file. Make sure it matches exactly.",
            ));
        }

        let count = content.matches(old_text).count();
        if count > 1 {
            return Ok(ToolResult::text(format!(
                "Warning: old_text appears {count} times. Please provide more context to make it unique."
            )));
        }

        let new_content = content.replacen(old_text, new_text, 1);
        match std::fs::write(&file_path, new_content) {
            Ok(()) => Ok(ToolResult::text(format!("Successfully edited {path}"))),
            Err(e) => Ok(ToolResult::text(format!("Error writing file: {e}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// list_dir
// ---------------------------------------------------------------------------

pub struct ListDirTool {
    allowed_dir: Option<PathBuf>,
}

impl ListDirTool {
    pub fn new(allowed_dir: Option<PathBuf>) -> Self {
        Self { allowed_dir }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List the contents of a directory."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The directory path to list"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(
        &self,
        _token: &CancellationToken,
        params: serde_json::Value,
    ) -> Result<ToolResult> {
        let path = params
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: path"))?;

        let dir_path = match resolve_path(path, self.allowed_dir.as_deref()) {
            Ok(p) => p,
            Err(e) => return Ok(ToolResult::text(format!("Error: {e}"))),
        };

        if !dir_path.exists() {
            return Ok(ToolResult::text(format!(
                "Error: Directory not found: {path}"
            )));
        }
        if !dir_path.is_dir() {
            return Ok(ToolResult::text(format!("Error: Not a directory: {path}")));
        }

        let mut entries: Vec<String> = Vec::new();
        match std::fs::read_dir(&dir_path) {
            Ok(read_dir) => {
                let mut items: Vec<_> = read_dir.flatten().collect();
                items.sort_by_key(|e| e.file_name());

                for item in items {
                    let name = item.file_name().to_string_lossy().to_string();
                    let prefix = if item.path().is_dir() {
                        "[dir]  "
                    } else {
                        "[file] "
                    };
                    entries.push(format!("{prefix}{name}"));
                }
            }
            Err(e) => return Ok(ToolResult::text(format!("Error listing directory: {e}"))),
        }

        if entries.is_empty() {
            Ok(ToolResult::text(format!("Directory {path} is empty")))
        } else {
            Ok(ToolResult::text(entries.join("\n")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_file_returns_contents() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("test.txt");
        std::fs::write(&file, "hello world").unwrap();

        let tool = ReadFileTool::new(None);
        let result = tool
            .execute(&CancellationToken::new(), serde_json::json!({"path": file.to_str().unwrap()}))
            .await
            .unwrap();
        assert_eq!(result.content, "hello world");
    }

    #[tokio::test]
    async fn read_file_not_found() {
        let tool = ReadFileTool::new(None);
        let result = tool
            .execute(&CancellationToken::new(), serde_json::json!({"path": "/tmp/nagobot_missing_file_test.txt"}))
            .await
            .unwrap();
        assert!(result.content.contains("not found"));
    }

    #[tokio::test]
    async fn read_file_rejects_directories() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ReadFileTool::new(None);
        let result = tool
            .execute(&CancellationToken::new(), serde_json::json!({"path": dir.path().to_str().unwrap()}))
            .await
            .unwrap();
        assert!(result.content.contains("Not a file"));
    }

    #[tokio::test]
    async fn read_file_outside_sandbox_fails() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ReadFileTool::new(Some(dir.path().to_path_buf()));
        let result = tool
            .execute(&CancellationToken::new(), serde_json::json!({"path": "/etc/hostname"}))
            .await
            .unwrap();
        assert!(result.content.contains("outside allowed directory"));
    }

    #[tokio::test]
    async fn write_file_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a/b/c/deep.txt");

        let tool = WriteFileTool::new(None);
        let result = tool
            .execute(&CancellationToken::new(), serde_json::json!({
                "path": file.to_str().unwrap(),
                "content": "deep"
            }))
            .await
            .unwrap();

        assert!(result.content.contains("Successfully wrote"));
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "deep");
    }

    #[tokio::test]
    async fn write_file_outside_sandbox_fails() {
        let dir = tempfile::tempdir().unwrap();
        let tool = WriteFileTool::new(Some(dir.path().to_path_buf()));
        let result = tool
            .execute(&CancellationToken::new(), serde_json::json!({
                "path": "/tmp/nagobot_escape_test.txt",
                "content": "nope"
            }))
            .await
            .unwrap();
        assert!(result.content.contains("outside allowed directory"));
    }

    #[tokio::test]
    async fn edit_file_replaces_unique_match() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("edit.txt");
        std::fs::write(&file, "hello world").unwrap();

        let tool = EditFileTool::new(None);
        let result = tool
            .execute(&CancellationToken::new(), serde_json::json!({
                "path": file.to_str().unwrap(),
                "old_text": "world",
                "new_text": "rust"
            }))
            .await
            .unwrap();

        assert!(result.content.contains("Successfully edited"));
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "hello rust");
    }

    #[tokio::test]
    async fn edit_file_reports_missing_old_text() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("edit.txt");
        std::fs::write(&file, "hello world").unwrap();

        let tool = EditFileTool::new(None);
        let result = tool
            .execute(&CancellationToken::new(), serde_json::json!({
                "path": file.to_str().unwrap(),
                "old_text": "nonexistent",
                "new_text": "replacement"
            }))
            .await
            .unwrap();

        assert!(result.content.contains("old_text not found"));
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "hello world");
    }

    #[tokio::test]
    async fn edit_file_refuses_ambiguous_match_without_modifying() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("edit.txt");
        std::fs::write(&file, "foo bar foo baz").unwrap();

        let tool = EditFileTool::new(None);
        let result = tool
            .execute(&CancellationToken::new(), serde_json::json!({
                "path": file.to_str().unwrap(),
                "old_text": "foo",
                "new_text": "qux"
            }))
            .await
            .unwrap();

        assert!(result.content.contains("appears 2 times"));
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "foo bar foo baz");
    }

    #[tokio::test]
    async fn list_dir_prefixes_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "").unwrap();
        std::fs::write(dir.path().join("a.txt"), "").unwrap();
        std::fs::create_dir(dir.path().join("subdir")).unwrap();

        let tool = ListDirTool::new(None);
        let result = tool
            .execute(&CancellationToken::new(), serde_json::json!({"path": dir.path().to_str().unwrap()}))
            .await
            .unwrap();

        let lines: Vec<&str> = result.content.lines().collect();
        assert_eq!(lines[0], "[file] a.txt");
        assert_eq!(lines[1], "[file] b.txt");
        assert_eq!(lines[2], "[dir]  subdir");
    }

    #[tokio::test]
    async fn list_dir_distinguishes_empty_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ListDirTool::new(None);

        let result = tool
            .execute(&CancellationToken::new(), serde_json::json!({"path": dir.path().to_str().unwrap()}))
            .await
            .unwrap();
        assert!(result.content.contains("is empty"));

        let result = tool
            .execute(&CancellationToken::new(), serde_json::json!({"path": "/tmp/nagobot_missing_dir_test"}))
            .await
            .unwrap();
        assert!(result.content.contains("not found"));
    }
}
