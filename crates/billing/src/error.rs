//! Billing error types

use thiserror::Error;

/// Failure talking to the Square API
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Connection could not be established or was dropped mid-request
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Square answered with a non-success status
    #[error("Square API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Square resource not found: {0}")]
    NotFound(String),

    #[error("Failed to decode Square response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Only transport-level failures are safe to retry blindly
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transport(_) | RemoteError::Timeout(_))
    }

    /// Square error code `IDEMPOTENCY_KEY_REUSED` means the same logical
    /// request was already accepted with a different body
    pub fn is_idempotency_reuse(&self) -> bool {
        match self {
            RemoteError::Api { body, .. } => body.contains("IDEMPOTENCY_KEY_REUSED"),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RemoteError::Timeout(e.to_string())
        } else if e.is_decode() {
            RemoteError::Decode(e.to_string())
        } else {
            RemoteError::Transport(e.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Same checkout requested again inside the debounce window
    #[error("Duplicate request: {0}")]
    DuplicateRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Webhook signature invalid")]
    WebhookSignatureInvalid,

    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),
}

pub type BillingResult<T> = Result<T, BillingError>;
