use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlmError {
    /// The proxy did not answer within the request timeout.
    #[error("LLM request timed out")]
    Timeout,

    /// Transport failure before a response arrived.
    #[error("LLM transport error: {0}")]
    Transport(String),

    /// The proxy answered with a non-success status.
    #[error("LLM proxy returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("invalid LLM response: {0}")]
    InvalidResponse(String),

    #[error("LLM serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LlmError::Timeout
        } else if e.is_decode() {
            LlmError::InvalidResponse(e.to_string())
        } else {
            LlmError::Transport(e.to_string())
        }
    }
}

impl LlmError {
    /// Whether a retry by operator re-enqueue makes sense (transport-level
    /// failures) as opposed to a malformed answer.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            LlmError::Timeout | LlmError::Transport(_) | LlmError::Http { .. }
        )
    }
}

pub type LlmResult<T> = Result<T, LlmError>;
