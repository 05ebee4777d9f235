use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use glue_core::registry::ToolSpec;
use glue_core::tool::{ToolCallError, ToolClient, ToolContext};
use serde_json::{json, Value};

type Responder = dyn Fn(&ToolSpec, &Value, usize) -> Result<Value, ToolCallError> + Send + Sync;

/// One recorded invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub tool: String,
    pub args: Value,
    /// Exposed secret handed to the call, if any
    pub secret: Option<String>,
}

/// Tool client that records every invocation and how many overlapped.
pub struct RecordingTool {
    provider: String,
    delay: Option<Duration>,
    responder: Box<Responder>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: Mutex<Vec<ToolInvocation>>,
}

impl RecordingTool {
    /// Echoes `{"tool": <name>, "args": <args>}`.
    pub fn new(provider: impl Into<String>) -> Self {
        Self::with_responder(provider, |spec, args, _| {
            Ok(json!({ "tool": spec.name, "args": args }))
        })
    }

    /// `respond` gets the spec, the arguments and the zero-based call index.
    pub fn with_responder(
        provider: impl Into<String>,
        respond: impl Fn(&ToolSpec, &Value, usize) -> Result<Value, ToolCallError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            provider: provider.into(),
            delay: None,
            responder: Box::new(respond),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<ToolInvocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Highest number of invocations ever running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolClient for RecordingTool {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn description(&self, tool: &ToolSpec) -> String {
        format!("Recording stand-in for {}", tool.name)
    }

    fn args_schema(&self, _tool: &ToolSpec) -> Value {
        json!({"type": "object", "properties": {"input": {"type": "string"}}})
    }

    fn prepare_input(&self, _tool: &ToolSpec, input: &str) -> Value {
        json!({ "input": input })
    }

    async fn invoke(&self, ctx: ToolContext<'_>, args: Value) -> Result<Value, ToolCallError> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(ToolInvocation {
                tool: ctx.tool.name.clone(),
                args: args.clone(),
                secret: ctx.secret.as_ref().map(|s| s.expose().to_string()),
            });
            calls.len() - 1
        };
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let result = (self.responder)(ctx.tool, &args, index);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
