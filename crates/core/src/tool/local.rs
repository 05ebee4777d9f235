use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use log::debug;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;

use super::{ToolCallError, ToolClient, ToolContext};
use crate::registry::ToolSpec;

const DEFAULT_BASE: &str = "./workspace";
const DEFAULT_FILE: &str = "output.md";

/// Reads and writes files under a base directory (`path` param).
///
/// Paths in arguments are relative to the base; absolute paths and `..`
/// components are refused.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFiles;

impl LocalFiles {
    pub fn new() -> Self {
        Self
    }

    fn base(tool: &ToolSpec) -> PathBuf {
        PathBuf::from(tool.param_str("path").unwrap_or(DEFAULT_BASE))
    }

    fn resolve(base: &Path, relative: &str) -> Result<PathBuf, ToolCallError> {
        let relative = Path::new(relative);
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => {
                    return Err(ToolCallError::AccessDenied(format!(
                        "`{}` escapes the workspace",
                        relative.display()
                    )))
                }
            }
        }
        Ok(base.join(relative))
    }

    fn content(args: &Value, json_format: bool) -> Result<String, ToolCallError> {
        match args.get("content") {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) if json_format => Ok(serde_json::to_string_pretty(other)?),
            Some(other) => Ok(other.to_string()),
            None => Err(ToolCallError::InvalidInput(
                "missing field `content`".to_string(),
            )),
        }
    }
}

#[async_trait]
impl ToolClient for LocalFiles {
    fn provider(&self) -> &str {
        "local"
    }

    fn description(&self, tool: &ToolSpec) -> String {
        format!(
            "Read, write, append, delete or list files under {}.",
            Self::base(tool).display()
        )
    }

    fn args_schema(&self, _tool: &ToolSpec) -> Value {
        json!({
            "type": "object",
            "properties": {
                "operation": {"type": "string", "enum": ["read", "write", "append", "delete", "list"]},
                "path": {"type": "string", "description": "Path relative to the workspace"},
                "content": {"description": "Text, or a JSON value when format is json"},
                "format": {"type": "string", "enum": ["text", "json"]}
            },
            "required": ["operation"]
        })
    }

    /// Plain text is written to the default file; a JSON object is taken as
    /// arguments.
    fn prepare_input(&self, tool: &ToolSpec, input: &str) -> Value {
        match serde_json::from_str::<Value>(input) {
            Ok(args @ Value::Object(_)) if args.get("operation").is_some() => args,
            _ => json!({
                "operation": "write",
                "path": tool.param_str("default_file").unwrap_or(DEFAULT_FILE),
                "content": input,
            }),
        }
    }

    async fn invoke(&self, ctx: ToolContext<'_>, args: Value) -> Result<Value, ToolCallError> {
        let operation = args
            .get("operation")
            .and_then(Value::as_str)
            .unwrap_or("read");
        let relative = args.get("path").and_then(Value::as_str).unwrap_or("");
        let json_format = args
            .get("format")
            .and_then(Value::as_str)
            .or_else(|| ctx.tool.param_str("format"))
            .is_some_and(|f| f.eq_ignore_ascii_case("json"));

        let base = Self::base(ctx.tool);
        let target = Self::resolve(&base, relative)?;
        if relative.is_empty() && operation != "list" {
            return Err(ToolCallError::InvalidInput(format!(
                "`{operation}` needs a `path`"
            )));
        }
        debug!("{operation} {} for `{}`", target.display(), ctx.tool.name);

        match operation {
            "read" => {
                let text = tokio::fs::read_to_string(&target).await?;
                let content = if json_format {
                    serde_json::from_str(&text)?
                } else {
                    Value::String(text)
                };
                Ok(json!({ "path": relative, "content": content }))
            }
            "write" | "append" => {
                let content = Self::content(&args, json_format)?;
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .write(true)
                    .append(operation == "append")
                    .truncate(operation == "write")
                    .open(&target)
                    .await?;
                file.write_all(content.as_bytes()).await?;
                file.flush().await?;
                Ok(json!({
                    "path": relative,
                    "operation": operation,
                    "bytes": content.len(),
                }))
            }
            "delete" => {
                tokio::fs::remove_file(&target).await?;
                Ok(json!({ "path": relative, "deleted": true }))
            }
            "list" => {
                let mut entries = Vec::new();
                let mut dir = tokio::fs::read_dir(&target).await?;
                while let Some(entry) = dir.next_entry().await? {
                    let mut name = entry.file_name().to_string_lossy().into_owned();
                    if entry.file_type().await?.is_dir() {
                        name.push('/');
                    }
                    entries.push(name);
                }
                entries.sort();
                Ok(json!({ "path": relative, "entries": entries }))
            }
            other => Err(ToolCallError::InvalidInput(format!(
                "unknown operation `{other}`"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn spec(base: &Path) -> ToolSpec {
        let mut spec = ToolSpec::new("file_handler", "local");
        spec.params
            .insert("path".into(), json!(base.to_string_lossy()));
        spec
    }

    async fn call(spec: &ToolSpec, args: Value) -> Result<Value, ToolCallError> {
        LocalFiles
            .invoke(
                ToolContext {
                    tool: spec,
                    secret: None,
                },
                args,
            )
            .await
    }

    #[tokio::test]
    async fn test_write_append_read_delete() {
        let dir = tempdir().unwrap();
        let spec = spec(dir.path());

        call(&spec, json!({"operation": "write", "path": "notes/a.txt", "content": "one"}))
            .await
            .unwrap();
        call(&spec, json!({"operation": "append", "path": "notes/a.txt", "content": " two"}))
            .await
            .unwrap();
        let read = call(&spec, json!({"operation": "read", "path": "notes/a.txt"}))
            .await
            .unwrap();
        assert_eq!(read["content"], "one two");

        let listed = call(&spec, json!({"operation": "list"})).await.unwrap();
        assert_eq!(listed["entries"], json!(["notes/"]));

        call(&spec, json!({"operation": "delete", "path": "notes/a.txt"}))
            .await
            .unwrap();
        assert!(!dir.path().join("notes/a.txt").exists());
    }

    #[tokio::test]
    async fn test_json_format() {
        let dir = tempdir().unwrap();
        let spec = spec(dir.path());
        call(
            &spec,
            json!({"operation": "write", "path": "d.json", "content": {"k": [1, 2]}, "format": "json"}),
        )
        .await
        .unwrap();
        let read = call(&spec, json!({"operation": "read", "path": "d.json", "format": "json"}))
            .await
            .unwrap();
        assert_eq!(read["content"], json!({"k": [1, 2]}));
    }

    #[tokio::test]
    async fn test_refuses_escaping_paths() {
        let dir = tempdir().unwrap();
        let spec = spec(dir.path());
        for bad in ["../secret", "/etc/passwd", "a/../../b"] {
            let err = call(&spec, json!({"operation": "read", "path": bad}))
                .await
                .unwrap_err();
            assert!(matches!(err, ToolCallError::AccessDenied(_)), "{bad}");
        }
    }

    #[test]
    fn test_prepare_input_from_text() {
        let spec = ToolSpec::new("file_handler", "local");
        let args = LocalFiles.prepare_input(&spec, "# Report");
        assert_eq!(args["operation"], "write");
        assert_eq!(args["path"], DEFAULT_FILE);
        assert_eq!(args["content"], "# Report");

        let args = LocalFiles.prepare_input(&spec, r#"{"operation": "read", "path": "x"}"#);
        assert_eq!(args["operation"], "read");
    }
}
