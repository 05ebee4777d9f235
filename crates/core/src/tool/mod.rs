use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use glue_llm::chat::Tool;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::registry::ToolSpec;
use crate::secret::SecretValue;

mod local;
mod python;
mod tavily;

pub use local::LocalFiles;
pub use python::PythonInterpreter;
pub use tavily::TavilySearch;

/// Result of a single tool invocation as handed back to a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub tool_name: String,
    pub success: bool,
    pub arguments: Value,
    pub result: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum ToolCallError {
    #[error("Runtime Error {0}")]
    RuntimeError(#[from] Box<dyn std::error::Error + Sync + Send>),

    #[error("Serde Error {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("Io Error {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),
}

impl ToolCallError {
    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ToolCallError::Timeout(_) | ToolCallError::Unavailable(_))
    }
}

impl From<reqwest::Error> for ToolCallError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ToolCallError::Timeout(err.to_string())
        } else if err.is_connect() {
            ToolCallError::Unavailable(err.to_string())
        } else {
            ToolCallError::RuntimeError(Box::new(err))
        }
    }
}

/// Everything a client needs for one invocation. The secret lives only for
/// the duration of the call.
pub struct ToolContext<'a> {
    pub tool: &'a ToolSpec,
    pub secret: Option<SecretValue>,
}

/// A tool provider (`tavily`, `python`, `local`, ...). One client serves
/// every tool block that names its provider.
#[async_trait]
pub trait ToolClient: Send + Sync {
    /// Provider keyword this client is registered under.
    fn provider(&self) -> &str;

    /// A description explaining the tool's purpose, shown to models.
    fn description(&self, tool: &ToolSpec) -> String;

    /// JSON schema of the arguments `invoke` accepts.
    fn args_schema(&self, tool: &ToolSpec) -> Value;

    /// Arguments for a chained call whose input is the previous stage's text.
    fn prepare_input(&self, tool: &ToolSpec, input: &str) -> Value;

    async fn invoke(&self, ctx: ToolContext<'_>, args: Value) -> Result<Value, ToolCallError>;
}

/// The function definition offered to a model for `spec`.
pub fn chat_tool(client: &dyn ToolClient, spec: &ToolSpec) -> Tool {
    Tool::function(
        spec.name.clone(),
        client.description(spec),
        client.args_schema(spec),
    )
}

/// Plain text for a tool output: strings as-is, anything else as JSON.
pub fn output_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

/// `args[key]` as a string, or a required-field error.
pub(crate) fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolCallError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolCallError::InvalidInput(format!("missing string field `{key}`")))
}

/// The block's `timeout` parameter in seconds. Unset or non-positive values
/// fall back to `default`; values no `Duration` can hold are rejected.
pub(crate) fn timeout_param(tool: &ToolSpec, default: Duration) -> Result<Duration, ToolCallError> {
    match tool.param_f64("timeout").filter(|t| *t > 0.0) {
        Some(secs) => Duration::try_from_secs_f64(secs)
            .map_err(|e| ToolCallError::InvalidInput(format!("timeout of {secs}s: {e}"))),
        None => Ok(default),
    }
}
