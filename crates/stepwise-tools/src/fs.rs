use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Value, json};
use stepwise_protocol::{Tool, ToolContext, ToolError, ToolSchema};
use tokio::fs;
use tracing::instrument;

fn required_str<'a>(input: &'a Value, tool: &str, field: &str) -> Result<&'a str, ToolError> {
    input
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::invalid_input(format!("{tool} requires input.{field}")))
}

/// Resolve `relative_path` under `ctx.cwd`, refusing anything that lands
/// outside `ctx.fs_root`.
fn workspace_path(ctx: &ToolContext, relative_path: &str) -> Result<PathBuf, ToolError> {
    let candidate = if Path::new(relative_path).is_absolute() {
        PathBuf::from(relative_path)
    } else {
        ctx.cwd.join(relative_path)
    };
    let root = ctx
        .fs_root
        .canonicalize()
        .unwrap_or_else(|_| ctx.fs_root.clone());
    let parent = candidate.parent().unwrap_or(root.as_path());

    if !parent.exists() {
        let lexical = !candidate
            .components()
            .any(|part| matches!(part, Component::ParentDir));
        if lexical && (candidate.starts_with(&root) || candidate.starts_with(&ctx.fs_root)) {
            return Ok(candidate);
        }
        return Err(ToolError::invalid_input(format!(
            "path escapes workspace root: {relative_path}"
        )));
    }

    let canonical_parent = parent.canonicalize().map_err(|err| {
        ToolError::execution(format!("failed canonicalizing {}: {err}", parent.display()))
    })?;
    if !canonical_parent.starts_with(&root) {
        return Err(ToolError::invalid_input(format!(
            "path escapes workspace root: {relative_path}"
        )));
    }
    Ok(candidate)
}

/// `read_file {path}` returns `{path, content}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name().to_owned(),
            description: "Read a UTF-8 text file from the workspace".to_owned(),
            parameters: json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"],
            }),
        }
    }

    #[instrument(skip_all, fields(tool = "read_file"))]
    async fn run(&self, input: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let path = required_str(&input, "read_file", "path")?;
        let absolute = workspace_path(ctx, path)?;
        let content = fs::read_to_string(&absolute).await.map_err(|err| {
            ToolError::execution(format!("failed reading {}: {err}", absolute.display()))
        })?;
        Ok(json!({ "path": path, "content": content }))
    }
}

/// `write_file {path, content}` returns `{path, bytes}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name().to_owned(),
            description: "Write a UTF-8 text file to the workspace".to_owned(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"},
                },
                "required": ["path", "content"],
            }),
        }
    }

    #[instrument(skip_all, fields(tool = "write_file"))]
    async fn run(&self, input: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let path = required_str(&input, "write_file", "path")?;
        let content = required_str(&input, "write_file", "content")?;
        let absolute = workspace_path(ctx, path)?;
        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent).await.map_err(|err| {
                ToolError::execution(format!("failed creating {}: {err}", parent.display()))
            })?;
        }
        fs::write(&absolute, content).await.map_err(|err| {
            ToolError::execution(format!("failed writing {}: {err}", absolute.display()))
        })?;
        Ok(json!({ "path": path, "bytes": content.len() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};
    use stepwise_protocol::{SessionId, ToolErrorKind};

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let root = std::env::temp_dir().join(format!("stepwise-tools-{name}-{nanos}"));
        std::fs::create_dir_all(&root).unwrap();
        root
    }

    #[tokio::test]
    async fn write_then_read_inside_workspace() {
        let root = unique_test_root("rw");
        let ctx = ToolContext::new(SessionId::default(), &root);

        let written = WriteFileTool
            .run(json!({"path": "notes/a.txt", "content": "hello"}), &ctx)
            .await
            .unwrap();
        assert_eq!(written["bytes"], 5);

        let read = ReadFileTool
            .run(json!({"path": "notes/a.txt"}), &ctx)
            .await
            .unwrap();
        assert_eq!(read["content"], "hello");
    }

    #[tokio::test]
    async fn escaping_paths_and_missing_fields_are_invalid_input() {
        let root = unique_test_root("escape");
        let ctx = ToolContext::new(SessionId::default(), &root);

        let err = ReadFileTool
            .run(json!({"path": "../../etc/passwd"}), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::InvalidInput);

        let err = WriteFileTool
            .run(json!({"path": "x.txt"}), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::InvalidInput);
        assert_eq!(err.message, "write_file requires input.content");
    }
}
