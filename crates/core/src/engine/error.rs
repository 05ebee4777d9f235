use std::fmt;

use glue_llm::LLMError;
use serde::Serialize;

use crate::protocol::Trace;
use crate::secret::{SecretError, SecretRef};
use crate::tool::ToolCallError;

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("loop budget of {limit} iterations exceeded")]
    LoopBudgetExceeded { limit: u32 },

    #[error("secret `{reference}` needed by `{subject}` is unavailable: {source}")]
    SecretMissing {
        subject: String,
        reference: SecretRef,
        #[source]
        source: SecretError,
    },

    #[error("`{subject}` timed out after {attempts} attempt(s)")]
    ProviderTimeout { subject: String, attempts: u32 },

    #[error("`{subject}` unavailable after {attempts} attempt(s): {message}")]
    ProviderUnavailable {
        subject: String,
        attempts: u32,
        message: String,
    },

    #[error("model `{model}` failed: {source}")]
    Provider {
        model: String,
        #[source]
        source: LLMError,
    },

    #[error("tool `{tool}` failed: {source}")]
    Tool {
        tool: String,
        #[source]
        source: ToolCallError,
    },

    #[error("`{block}` uses provider `{provider}` but no client is registered for it")]
    UnknownProvider { block: String, provider: String },

    #[error("run cancelled")]
    Cancelled,
}

/// Last model output before a run stopped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepOutput {
    pub model: String,
    pub output: String,
    pub iteration: u32,
}

/// A completed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutput {
    pub artifact: String,
    pub trace: Trace,
    /// Iterations started, counting the first.
    pub iterations: u32,
}

/// A failed run with everything recorded up to the failure.
#[derive(Debug)]
pub struct RunFailure {
    pub error: RunError,
    pub trace: Trace,
    pub last_state: Option<StepOutput>,
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        if let Some(state) = &self.last_state {
            write!(
                f,
                " (last output from `{}` in iteration {})",
                state.model, state.iteration
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for RunFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
