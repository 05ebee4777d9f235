//! LLM collaborator interface for GLUE.
//!
//! The orchestration engine only talks to models through [`ChatProvider`];
//! [`backends::openrouter::OpenRouter`] is the reference backend.

pub mod backends;
pub mod chat;
pub mod common;
pub mod error;
mod net;
pub(crate) mod utils;

pub use chat::{
    ApiKey, ChatMessage, ChatProvider, ChatRequest, ChatResponse, ChatRole, FunctionCall,
    FunctionTool, Tool, ToolCall,
};
pub use error::LLMError;

/// Initialise `env_logger` for binaries that only depend on this crate.
#[cfg(feature = "logging")]
pub fn init_logging() {
    let _ = env_logger::try_init();
}
