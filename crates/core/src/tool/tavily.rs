use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{required_str, timeout_param, ToolCallError, ToolClient, ToolContext};
use crate::registry::ToolSpec;

const DEFAULT_BASE_URL: &str = "https://api.tavily.com";
const API_KEY_ENV: &str = "TAVILY_API_KEY";
const DEFAULT_MAX_RESULTS: u64 = 5;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Web search through the Tavily API.
#[derive(Debug, Clone)]
pub struct TavilySearch {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    score: f64,
}

impl Default for TavilySearch {
    fn default() -> Self {
        Self::new()
    }
}

impl TavilySearch {
    pub fn new() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn set_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn api_key(ctx: &ToolContext<'_>) -> Result<String, ToolCallError> {
        if let Some(secret) = &ctx.secret {
            return Ok(secret.expose().to_string());
        }
        std::env::var(API_KEY_ENV)
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                ToolCallError::AccessDenied(format!(
                    "no API key configured for `{}`",
                    ctx.tool.name
                ))
            })
    }
}

#[async_trait]
impl ToolClient for TavilySearch {
    fn provider(&self) -> &str {
        "tavily"
    }

    fn description(&self, _tool: &ToolSpec) -> String {
        "Search the web and return ranked results with titles, URLs and snippets.".to_string()
    }

    fn args_schema(&self, _tool: &ToolSpec) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "What to search for"},
                "max_results": {"type": "integer", "minimum": 1}
            },
            "required": ["query"]
        })
    }

    fn prepare_input(&self, _tool: &ToolSpec, input: &str) -> Value {
        json!({ "query": input })
    }

    async fn invoke(&self, ctx: ToolContext<'_>, args: Value) -> Result<Value, ToolCallError> {
        let query = required_str(&args, "query")?;
        if query.trim().is_empty() {
            return Err(ToolCallError::InvalidInput("empty search query".into()));
        }
        let max_results = args
            .get("max_results")
            .and_then(Value::as_u64)
            .or_else(|| ctx.tool.param_u64("max_results"))
            .unwrap_or(DEFAULT_MAX_RESULTS);
        let timeout = timeout_param(ctx.tool, DEFAULT_TIMEOUT)?;

        let mut body = json!({
            "api_key": Self::api_key(&ctx)?,
            "query": query,
            "max_results": max_results,
            "include_answer": true,
        });
        if let Some(depth) = ctx.tool.param_str("search_depth") {
            body["search_depth"] = Value::String(depth.to_string());
        }

        debug!("Tavily search for `{}`: {query}", ctx.tool.name);
        let response = self
            .client
            .post(format!("{}/search", self.base_url))
            .timeout(timeout)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            let message = format!("HTTP {status}: {text}");
            return Err(match status.as_u16() {
                401 | 403 => ToolCallError::AccessDenied(message),
                408 => ToolCallError::Timeout(message),
                429 | 500..=599 => ToolCallError::Unavailable(message),
                _ => ToolCallError::RuntimeError(message.into()),
            });
        }

        let mut parsed: SearchResponse = serde_json::from_str(&text)?;
        parsed
            .results
            .sort_by(|a, b| b.score.total_cmp(&a.score));
        let results: Vec<Value> = parsed
            .results
            .into_iter()
            .map(|hit| {
                json!({
                    "title": hit.title,
                    "url": hit.url,
                    "content": hit.content,
                    "score": hit.score,
                })
            })
            .collect();

        Ok(json!({
            "query": query,
            "answer": parsed.answer,
            "results": results,
        }))
    }
}
