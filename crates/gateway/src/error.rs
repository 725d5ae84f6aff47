//! Gateway error types.

use common::{ErrorCode, ErrorPayload};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Inbound frame failed schema validation.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Quota denial, with the client's retry hint.
    #[error("rate limited")]
    RateLimited { retry_after_ms: u64 },

    /// The connection holds a race slot already.
    #[error("already in a race")]
    AlreadyRacing,

    #[error("test engine: {0}")]
    Test(#[from] test_engine::TestError),

    #[error("race engine: {0}")]
    Race(#[from] race_engine::RaceError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Wire envelope for this error. Internal detail never leaks: the
    /// client sees the taxonomy code and a user-safe message.
    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            GatewayError::Json(_) => {
                ErrorPayload::new(ErrorCode::ValidationError, "malformed event payload")
            }
            GatewayError::RateLimited { retry_after_ms } => {
                ErrorPayload::rate_limited(*retry_after_ms)
            }
            GatewayError::AlreadyRacing => {
                ErrorPayload::new(ErrorCode::ValidationError, "already in a race")
            }
            GatewayError::Test(err) => ErrorPayload::new(err.wire_code(), err.to_string()),
            GatewayError::Race(err) => ErrorPayload::new(err.wire_code(), err.to_string()),
            GatewayError::Internal(_) => {
                ErrorPayload::new(ErrorCode::ServerError, "internal server error")
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
