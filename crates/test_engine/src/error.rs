//! Test-domain error types.

use common::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TestError {
    #[error("test not found")]
    NotFound,

    #[error("test expired")]
    Expired,

    #[error("test already completed")]
    AlreadyCompleted,

    /// Keystrokes are accepted only from the connection that started the
    /// test.
    #[error("not the session owner")]
    NotOwner,

    /// Key literals must be exactly one character.
    #[error("invalid key literal")]
    InvalidKey,

    #[error("invalid test parameters: {0}")]
    InvalidParams(String),

    #[error("word source failed: {0}")]
    WordSource(#[from] external_services::ProviderError),
}

impl TestError {
    /// Wire code for the error envelope.
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            TestError::NotFound => ErrorCode::TestNotFound,
            TestError::Expired => ErrorCode::TestExpired,
            TestError::AlreadyCompleted => ErrorCode::TestCompleted,
            TestError::NotOwner => ErrorCode::AuthForbidden,
            TestError::InvalidKey | TestError::InvalidParams(_) => ErrorCode::ValidationError,
            TestError::WordSource(_) => ErrorCode::NoWordlistsAvailable,
        }
    }
}

pub type Result<T> = std::result::Result<T, TestError>;
