//! OpenRouter chat backend.
//!
//! OpenRouter speaks the OpenAI `/chat/completions` dialect, so requests and
//! responses go through the shared OpenAI-style wire types.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use serde_json::Value;
use strum_macros::{Display, EnumString};

use crate::{
    chat::{ApiKey, ChatProvider, ChatRequest, ChatResponse},
    common::openai_types::{OpenAIStyleChatCompletionRequest, OpenAIStyleChatCompletionResponse},
    error::LLMError,
    net::http_request::HTTPRequest,
    utils::url::create_model_url,
};

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_MODEL: &str = "liquid/lfm-40b:free";
pub const API_KEY_ENV: &str = "OPENROUTER_API_KEY";

#[derive(Debug, EnumString, Display, Clone, Copy)]
pub enum OpenRouterAPI {
    #[strum(serialize = "chat/completions")]
    ChatCompletion,
}

#[derive(Debug, Clone)]
pub struct OpenRouter {
    base_url: String,
    api_key: Option<ApiKey>,
    referer: String,
    title: String,
    timeout: Option<Duration>,
    client: reqwest::Client,
}

impl Default for OpenRouter {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            api_key: None,
            referer: "https://github.com/paradiseLabs/glue".into(),
            title: "GLUE".into(),
            timeout: None,
            client: reqwest::Client::new(),
        }
    }
}

impl OpenRouter {
    pub fn new() -> Self {
        Default::default()
    }

    /// Build a provider whose fallback key is read from `OPENROUTER_API_KEY`.
    pub fn from_env() -> Self {
        let mut provider = Self::new();
        provider.api_key = std::env::var(API_KEY_ENV).ok().map(ApiKey::new);
        provider
    }

    pub fn set_base_url<T: Into<String>>(mut self, base_url: T) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Fallback key used when a request carries none.
    pub fn set_api_key<T: Into<String>>(mut self, api_key: T) -> Self {
        self.api_key = Some(ApiKey::new(api_key));
        self
    }

    pub fn set_referer<T: Into<String>>(mut self, referer: T) -> Self {
        self.referer = referer.into();
        self
    }

    pub fn set_title<T: Into<String>>(mut self, title: T) -> Self {
        self.title = title.into();
        self
    }

    pub fn set_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn chat_url(&self) -> String {
        create_model_url(&self.base_url, OpenRouterAPI::ChatCompletion)
    }
}

#[async_trait]
impl ChatProvider for OpenRouter {
    fn name(&self) -> &str {
        "openrouter"
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LLMError> {
        let api_key = request
            .api_key
            .clone()
            .or_else(|| self.api_key.clone())
            .ok_or_else(|| LLMError::AuthError("OpenRouter API key not set".to_string()))?;

        let model = if request.model.is_empty() {
            DEFAULT_MODEL.to_string()
        } else {
            request.model.clone()
        };
        let mut body = OpenAIStyleChatCompletionRequest::from(request);
        body.model = model;
        let body: Value = serde_json::to_value(&body)?;

        let headers = [
            ("Authorization", format!("Bearer {}", api_key.expose())),
            ("HTTP-Referer", self.referer.clone()),
            ("X-Title", self.title.clone()),
        ];

        let url = self.chat_url();
        debug!("OpenRouter request to {url} for model {}", body["model"]);
        let raw = HTTPRequest::request_with_headers(&self.client, &url, &body, &headers, self.timeout)
            .await?;

        let parsed: OpenAIStyleChatCompletionResponse =
            serde_json::from_str(&raw).map_err(|e| LLMError::ResponseFormatError {
                message: e.to_string(),
                raw_response: raw.clone(),
            })?;

        if let Some(error) = &parsed.error {
            warn!("OpenRouter returned an error body: {}", error.message);
            return Err(LLMError::ProviderError(error.message.clone()));
        }

        parsed
            .into_chat_response()
            .ok_or_else(|| LLMError::ResponseFormatError {
                message: "response contained no choices".to_string(),
                raw_response: raw,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_url() {
        let provider = OpenRouter::new().set_base_url("http://localhost:9000/api/v1/");
        assert_eq!(
            provider.chat_url(),
            "http://localhost:9000/api/v1/chat/completions"
        );
        assert_eq!(
            OpenRouter::new().chat_url(),
            "https://openrouter.ai/api/v1/chat/completions"
        );
    }

    #[tokio::test]
    async fn test_missing_key_is_auth_error() {
        let provider = OpenRouter::new().set_base_url("http://127.0.0.1:9");
        let err = provider
            .chat(ChatRequest::new(DEFAULT_MODEL, vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, LLMError::AuthError(_)));
    }
}
