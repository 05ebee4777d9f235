//! Test doubles shared by the workspace's integration tests.

mod llm;
mod tool;

use std::sync::Arc;

use glue_core::secret::{SecretResolver, StaticSecrets};

pub use llm::{last_user_message, system_prompt, tool_call, ScriptedLLM};
pub use tool::{RecordingTool, ToolInvocation};

/// Resolver holding exactly `pairs`.
pub fn secrets(pairs: &[(&str, &str)]) -> Arc<dyn SecretResolver> {
    let store = pairs
        .iter()
        .fold(StaticSecrets::new(), |store, (name, value)| store.with(*name, *value));
    Arc::new(store)
}

/// Resolver that knows no secrets at all.
pub fn no_secrets() -> Arc<dyn SecretResolver> {
    Arc::new(StaticSecrets::new())
}
