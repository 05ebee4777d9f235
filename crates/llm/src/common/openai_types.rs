//! Wire types for OpenAI-compatible `/chat/completions` endpoints.

use serde::{Deserialize, Serialize};

use crate::chat::{ChatMessage, ChatRequest, ChatResponse, FunctionCall, Tool, ToolCall};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIStyleMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<OpenAIStyleToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl From<ChatMessage> for OpenAIStyleMessage {
    fn from(value: ChatMessage) -> Self {
        let tool_calls = if value.tool_calls.is_empty() {
            None
        } else {
            Some(value.tool_calls.into_iter().map(Into::into).collect())
        };
        Self {
            role: value.role.to_string(),
            content: value.content,
            tool_calls,
            tool_call_id: value.tool_call_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIStyleToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub tool_type: String,
    pub function: OpenAIStyleToolCallFunction,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIStyleToolCallFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

impl From<ToolCall> for OpenAIStyleToolCall {
    fn from(value: ToolCall) -> Self {
        Self {
            id: value.id,
            tool_type: value.call_type,
            function: OpenAIStyleToolCallFunction {
                name: value.function.name,
                arguments: value.function.arguments,
            },
        }
    }
}

impl From<OpenAIStyleToolCall> for ToolCall {
    fn from(value: OpenAIStyleToolCall) -> Self {
        Self {
            id: value.id,
            call_type: value.tool_type,
            function: FunctionCall {
                name: value.function.name,
                arguments: value.function.arguments,
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct OpenAIStyleChatCompletionRequest {
    pub model: String,
    pub messages: Vec<OpenAIStyleMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    pub stream: bool,
}

impl From<ChatRequest> for OpenAIStyleChatCompletionRequest {
    fn from(value: ChatRequest) -> Self {
        Self {
            model: value.model,
            messages: value.messages.into_iter().map(Into::into).collect(),
            tools: if value.tools.is_empty() {
                None
            } else {
                Some(value.tools)
            },
            max_tokens: value.max_tokens,
            temperature: value.temperature,
            top_p: value.top_p,
            stream: false,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct OpenAIStyleChatChoice {
    pub message: OpenAIStyleResponseMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIStyleResponseMessage {
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<OpenAIStyleToolCall>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIStyleErrorBody {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIStyleChatCompletionResponse {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<OpenAIStyleChatChoice>,
    /// Some gateways report upstream failures with a 200 and an error body.
    #[serde(default)]
    pub error: Option<OpenAIStyleErrorBody>,
}

impl OpenAIStyleChatCompletionResponse {
    /// Take the first choice as a [`ChatResponse`].
    pub fn into_chat_response(self) -> Option<ChatResponse> {
        let choice = self.choices.into_iter().next()?;
        Some(ChatResponse {
            text: choice.message.content,
            tool_calls: choice.message.tool_calls.into_iter().map(Into::into).collect(),
        })
    }
}
