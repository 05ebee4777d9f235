//! GLUE: declarative orchestration of multi-agent LLM pipelines.
//!
//! Re-exports the engine ([`core`]) and the model client layer ([`llm`]).

// Re-export for convenience
pub use async_trait::async_trait;

pub use glue_core::{self as core, Error as CoreError};
pub use glue_llm::{self as llm, error as llm_error};

/// Initialise `env_logger` from `RUST_LOG`. Safe to call more than once.
#[cfg(feature = "logging")]
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const SOURCE: &str = "glue app { model = echo }\necho { openrouter }\napply glue";

    #[test]
    fn test_core_module_available() {
        let config = core::EngineConfig::default();
        assert_eq!(config.channel_buffer, 100);
        assert_eq!(config.max_iterations, 10);
    }

    #[test]
    fn test_llm_error_available() {
        let error = llm_error::LLMError::AuthError("test error".to_string());
        assert_eq!(error.to_string(), "Auth Error: test error");
    }

    #[test]
    fn test_chat_message_builder() {
        let message = llm::ChatMessage::user().content("Hello world").build();

        assert_eq!(message.role, llm::ChatRole::User);
        assert_eq!(message.content, "Hello world");
    }

    #[test]
    fn test_program_parses_through_facade() {
        let program = core::Program::parse(
            SOURCE,
            &core::ProviderCatalog::builtin(),
            &core::BuildOptions::default(),
        )
        .unwrap();
        assert_eq!(program.registry().models().len(), 1);
    }

    #[test]
    fn test_core_error_available() {
        let error = core::Program::parse(
            "glue app { model = echo }",
            &core::ProviderCatalog::builtin(),
            &core::BuildOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(error, CoreError::Build(core::BuildError::NotApplied)));
    }

    #[test]
    fn test_tool_types_available() {
        let tool_result = core::tool::ToolCallResult {
            tool_name: "web_search".to_string(),
            success: true,
            arguments: serde_json::json!({"query": "rust"}),
            result: serde_json::json!({"results": []}),
        };

        let value = serde_json::to_value(&tool_result).unwrap();
        assert_eq!(value["tool_name"], "web_search");
    }

    #[tokio::test]
    async fn test_engine_runs_with_custom_provider() {
        struct Upper;

        #[async_trait]
        impl llm::ChatProvider for Upper {
            fn name(&self) -> &str {
                "upper"
            }

            async fn chat(
                &self,
                request: llm::ChatRequest,
            ) -> Result<llm::ChatResponse, llm_error::LLMError> {
                let text = request
                    .messages
                    .last()
                    .map(|m| m.content.to_uppercase())
                    .unwrap_or_default();
                Ok(llm::ChatResponse::text(text))
            }
        }

        let program = core::Program::parse(
            SOURCE,
            &core::ProviderCatalog::builtin(),
            &core::BuildOptions::default(),
        )
        .unwrap();
        let engine = program.into_engine(
            core::Providers::new().with_model("openrouter", Arc::new(Upper)),
            Arc::new(core::secret::StaticSecrets::new()),
            core::EngineConfig::default(),
        );
        let output = engine.run("hello").await.unwrap();
        assert_eq!(output.artifact, "HELLO");
    }
}
