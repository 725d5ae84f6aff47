//! Wire error taxonomy.
//!
//! Every error a client can observe maps to a stable numeric code grouped by
//! family: authentication (1xxx), race domain (2xxx), test domain (3xxx),
//! quota (4xxx), server (5xxx). The engine only produces the code, kind and
//! a user-safe message; recovery strategy is the client's concern.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Stable error codes observable on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    AuthRequired,
    AuthInvalid,
    AuthForbidden,
    TooManyConnections,
    RaceNotFound,
    RaceFull,
    RaceStarted,
    RaceFinished,
    NotInRace,
    TestNotFound,
    TestExpired,
    TestCompleted,
    RateLimited,
    ValidationError,
    ServerError,
    NoWordlistsAvailable,
    SlowConsumer,
}

impl ErrorCode {
    /// Numeric code carried in the error envelope.
    pub fn code(self) -> u16 {
        match self {
            ErrorCode::AuthRequired => 1001,
            ErrorCode::AuthInvalid => 1002,
            ErrorCode::AuthForbidden => 1003,
            ErrorCode::TooManyConnections => 1004,
            ErrorCode::RaceNotFound => 2001,
            ErrorCode::RaceFull => 2002,
            ErrorCode::RaceStarted => 2003,
            ErrorCode::RaceFinished => 2004,
            ErrorCode::NotInRace => 2005,
            ErrorCode::TestNotFound => 3001,
            ErrorCode::TestExpired => 3002,
            ErrorCode::TestCompleted => 3003,
            ErrorCode::RateLimited => 4001,
            ErrorCode::ValidationError => 4002,
            ErrorCode::ServerError => 5001,
            ErrorCode::NoWordlistsAvailable => 5002,
            ErrorCode::SlowConsumer => 5003,
        }
    }

    /// Stable kind string carried in the error envelope.
    pub fn kind(self) -> &'static str {
        match self {
            ErrorCode::AuthRequired => "AUTH_REQUIRED",
            ErrorCode::AuthInvalid => "AUTH_INVALID",
            ErrorCode::AuthForbidden => "AUTH_FORBIDDEN",
            ErrorCode::TooManyConnections => "TOO_MANY_CONNECTIONS",
            ErrorCode::RaceNotFound => "RACE_NOT_FOUND",
            ErrorCode::RaceFull => "RACE_FULL",
            ErrorCode::RaceStarted => "RACE_STARTED",
            ErrorCode::RaceFinished => "RACE_FINISHED",
            ErrorCode::NotInRace => "NOT_IN_RACE",
            ErrorCode::TestNotFound => "TEST_NOT_FOUND",
            ErrorCode::TestExpired => "TEST_EXPIRED",
            ErrorCode::TestCompleted => "TEST_COMPLETED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::ServerError => "SERVER_ERROR",
            ErrorCode::NoWordlistsAvailable => "NO_WORDLISTS_AVAILABLE",
            ErrorCode::SlowConsumer => "SLOW_CONSUMER",
        }
    }
}

/// Payload of the `error` outbound event.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub code: u16,
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            kind: code.kind().to_string(),
            message: message.into(),
            details: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Envelope for a quota denial, carrying the retry hint.
    pub fn rate_limited(retry_after_ms: u64) -> Self {
        Self::new(ErrorCode::RateLimited, "rate limit exceeded")
            .with_details(serde_json::json!({ "retry_after_ms": retry_after_ms }))
    }
}
