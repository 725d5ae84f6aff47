//! Provider error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Credential absent or structurally malformed.
    #[error("credential missing or malformed")]
    CredentialMalformed,

    /// Signature mismatch or expired token.
    #[error("credential rejected: {0}")]
    CredentialRejected(String),

    /// The requested word list does not exist or holds no words.
    #[error("no word list available: {0}")]
    WordListUnavailable(String),

    /// The result sink refused or timed out.
    #[error("result sink unavailable: {0}")]
    SinkUnavailable(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ProviderError>;
