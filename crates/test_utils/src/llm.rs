use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use glue_llm::{ChatProvider, ChatRequest, ChatResponse, ChatRole, FunctionCall, LLMError, ToolCall};

type Script = dyn Fn(&ChatRequest, usize) -> Result<ChatResponse, LLMError> + Send + Sync;

/// Chat provider driven by a closure.
///
/// The closure receives the request and the zero-based index of the call,
/// so tests can script a conversation turn by turn.
pub struct ScriptedLLM {
    name: String,
    script: Box<Script>,
    delay: Option<Duration>,
    calls: Mutex<Vec<ChatRequest>>,
}

impl ScriptedLLM {
    pub fn new(
        script: impl Fn(&ChatRequest, usize) -> Result<ChatResponse, LLMError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: "scripted".to_string(),
            script: Box::new(script),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Replies with the last user message.
    pub fn echo() -> Self {
        Self::new(|req, _| Ok(ChatResponse::text(last_user_message(req))))
    }

    /// Replies with `text` every time.
    pub fn always(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(move |_, _| Ok(ChatResponse::text(text.clone())))
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sleep before every reply; combine with a paused tokio clock.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every request received so far.
    pub fn calls(&self) -> Vec<ChatRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatProvider for ScriptedLLM {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LLMError> {
        let index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(request.clone());
            calls.len() - 1
        };
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.script)(&request, index)
    }
}

/// Content of the last user message, or "" when there is none.
pub fn last_user_message(request: &ChatRequest) -> &str {
    request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == ChatRole::User)
        .map(|m| m.content.as_str())
        .unwrap_or_default()
}

pub fn system_prompt(request: &ChatRequest) -> Option<&str> {
    request
        .messages
        .iter()
        .find(|m| m.role == ChatRole::System)
        .map(|m| m.content.as_str())
}

pub fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        call_type: "function".to_string(),
        function: FunctionCall {
            name: name.to_string(),
            arguments: arguments.to_string(),
        },
    }
}
