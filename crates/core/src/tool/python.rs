use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde_json::{json, Value};
use tokio::process::Command;

use super::{required_str, timeout_param, ToolCallError, ToolClient, ToolContext};
use crate::registry::ToolSpec;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Language {
    Python,
    JavaScript,
}

impl Language {
    fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "python" | "py" | "python3" => Some(Language::Python),
            "javascript" | "js" | "node" => Some(Language::JavaScript),
            _ => None,
        }
    }
}

/// Runs code snippets in a local interpreter process.
///
/// Every call spawns a fresh process that is killed when the timeout
/// (`timeout` param, seconds, default 30) elapses.
#[derive(Debug, Clone)]
pub struct PythonInterpreter {
    python: String,
    node: String,
}

impl Default for PythonInterpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl PythonInterpreter {
    pub fn new() -> Self {
        Self {
            python: "python3".to_string(),
            node: "node".to_string(),
        }
    }

    /// Executable used for Python code; it is run as `<exe> -c <code>`.
    pub fn with_python(mut self, executable: impl Into<String>) -> Self {
        self.python = executable.into();
        self
    }

    /// Executable used for JavaScript code; it is run as `<exe> -e <code>`.
    pub fn with_node(mut self, executable: impl Into<String>) -> Self {
        self.node = executable.into();
        self
    }

    fn command(&self, language: Language, code: &str) -> Command {
        let (program, flag) = match language {
            Language::Python => (&self.python, "-c"),
            Language::JavaScript => (&self.node, "-e"),
        };
        let mut command = Command::new(program);
        command
            .arg(flag)
            .arg(code)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl ToolClient for PythonInterpreter {
    fn provider(&self) -> &str {
        "python"
    }

    fn description(&self, _tool: &ToolSpec) -> String {
        "Execute a Python or JavaScript snippet and return its output.".to_string()
    }

    fn args_schema(&self, _tool: &ToolSpec) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": {"type": "string"},
                "language": {"type": "string", "enum": ["python", "javascript"]}
            },
            "required": ["code"]
        })
    }

    fn prepare_input(&self, _tool: &ToolSpec, input: &str) -> Value {
        json!({ "code": input })
    }

    async fn invoke(&self, ctx: ToolContext<'_>, args: Value) -> Result<Value, ToolCallError> {
        let code = required_str(&args, "code")?;
        let language_name = args
            .get("language")
            .and_then(Value::as_str)
            .or_else(|| ctx.tool.param_str("language"))
            .unwrap_or("python");
        let language = Language::parse(language_name).ok_or_else(|| {
            ToolCallError::InvalidInput(format!("unsupported language `{language_name}`"))
        })?;
        let timeout = timeout_param(ctx.tool, DEFAULT_TIMEOUT)?;

        let mut command = self.command(language, code);
        if let Some(dir) = ctx.tool.param_str("workdir") {
            command.current_dir(dir);
        }

        debug!("Running {language:?} snippet for `{}`", ctx.tool.name);
        let output = match tokio::time::timeout(timeout, command.output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(ToolCallError::Timeout(format!(
                    "execution exceeded {timeout:?}"
                )))
            }
        };

        Ok(json!({
            "success": output.status.success(),
            "output": String::from_utf8_lossy(&output.stdout),
            "error": String::from_utf8_lossy(&output.stderr),
            "exit_code": output.status.code(),
        }))
    }
}
