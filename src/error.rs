// ABOUTME: Defines all error types for llm-relay using thiserror.
// ABOUTME: Streaming failures are classified here and surfaced as terminal events.

/// Top-level error type for the llm-relay library.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Token error: {0}")]
    Token(#[from] TokenError),
}

/// Errors from provider adapters.
///
/// Everything except [`LlmError::MalformedChunk`] ends a stream with an
/// `error` terminal event whose message is this error's `Display` output.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP error {status} {status_text}: {body}")]
    Http {
        status: u16,
        status_text: String,
        body: String,
    },

    #[error("Rate limit exceeded (429), retry after: {retry_after}. {body}")]
    RateLimited { retry_after: String, body: String },

    #[error("Malformed stream chunk: {0}")]
    MalformedChunk(String),

    #[error("Request was aborted")]
    Aborted,

    #[error("{0}")]
    ProviderState(String),

    #[error("Authentication failed: {0}")]
    Token(#[from] TokenError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Stream closed unexpectedly")]
    StreamClosed,
}

impl LlmError {
    /// True for the HTTP 429 classification.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, LlmError::RateLimited { .. })
    }

    /// HTTP status code carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            LlmError::Http { status, .. } => Some(*status),
            LlmError::RateLimited { .. } => Some(429),
            LlmError::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Errors from token providers.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("No credential available: {0}")]
    Unavailable(String),

    #[error("Token acquisition failed: {0}")]
    Acquisition(#[source] anyhow::Error),
}
