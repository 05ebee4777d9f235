use std::fmt;

/// Error types that can occur when interacting with LLM providers.
#[derive(Debug)]
pub enum LLMError {
    /// HTTP request/response errors
    HttpError(String),
    /// The request did not complete within the allotted time
    Timeout(String),
    /// The provider is temporarily unreachable (connection refused, 429, 5xx)
    Unavailable { status: Option<u16>, message: String },
    /// Authentication and authorization errors
    AuthError(String),
    /// Invalid request parameters or format
    InvalidRequest(String),
    /// Errors returned by the LLM provider
    ProviderError(String),
    /// API response parsing or format error
    ResponseFormatError {
        message: String,
        raw_response: String,
    },
    /// Generic error
    Generic(String),
    /// JSON serialization/deserialization errors
    JsonError(String),
    /// Tool configuration error
    ToolConfigError(String),
}

impl LLMError {
    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LLMError::Timeout(_) | LLMError::Unavailable { .. })
    }

    /// Classify a non-success HTTP status returned by a provider.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let message = body.into();
        match status {
            401 | 403 => LLMError::AuthError(message),
            408 => LLMError::Timeout(message),
            429 | 500..=599 => LLMError::Unavailable {
                status: Some(status),
                message,
            },
            400..=499 => LLMError::InvalidRequest(message),
            _ => LLMError::ProviderError(format!("status {status}: {message}")),
        }
    }
}

impl fmt::Display for LLMError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LLMError::HttpError(e) => write!(f, "HTTP Error: {e}"),
            LLMError::Timeout(e) => write!(f, "Timeout: {e}"),
            LLMError::Unavailable {
                status: Some(status),
                message,
            } => write!(f, "Provider Unavailable ({status}): {message}"),
            LLMError::Unavailable {
                status: None,
                message,
            } => write!(f, "Provider Unavailable: {message}"),
            LLMError::AuthError(e) => write!(f, "Auth Error: {e}"),
            LLMError::InvalidRequest(e) => write!(f, "Invalid Request: {e}"),
            LLMError::ProviderError(e) => write!(f, "Provider Error: {e}"),
            LLMError::Generic(e) => write!(f, "Generic Error : {e}"),
            LLMError::ResponseFormatError {
                message,
                raw_response,
            } => {
                write!(
                    f,
                    "Response Format Error: {message}. Raw response: {raw_response}"
                )
            }
            LLMError::JsonError(e) => write!(f, "JSON Parse Error: {e}"),
            LLMError::ToolConfigError(e) => write!(f, "Tool Configuration Error: {e}"),
        }
    }
}

impl std::error::Error for LLMError {}

/// Converts reqwest HTTP errors into LLMErrors, keeping timeouts and
/// connection failures distinguishable so callers can retry them.
impl From<reqwest::Error> for LLMError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LLMError::Timeout(err.to_string())
        } else if err.is_connect() {
            LLMError::Unavailable {
                status: None,
                message: err.to_string(),
            }
        } else if let Some(status) = err.status() {
            LLMError::from_status(status.as_u16(), err.to_string())
        } else {
            LLMError::HttpError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for LLMError {
    fn from(err: serde_json::Error) -> Self {
        LLMError::JsonError(format!(
            "{} at line {} column {}",
            err,
            err.line(),
            err.column()
        ))
    }
}
