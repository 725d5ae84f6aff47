//! Race-domain error types.

use common::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RaceError {
    #[error("race not found")]
    NotFound,

    #[error("race is full")]
    Full,

    /// Joins are only accepted while the race is waiting.
    #[error("race already started")]
    AlreadyStarted,

    #[error("race already finished")]
    Finished,

    #[error("not a player in this race")]
    NotInRace,

    #[error("invalid race parameters: {0}")]
    InvalidParams(String),

    #[error("word source failed: {0}")]
    WordSource(#[from] external_services::ProviderError),
}

impl RaceError {
    /// Wire code for the error envelope.
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            RaceError::NotFound => ErrorCode::RaceNotFound,
            RaceError::Full => ErrorCode::RaceFull,
            RaceError::AlreadyStarted => ErrorCode::RaceStarted,
            RaceError::Finished => ErrorCode::RaceFinished,
            RaceError::NotInRace => ErrorCode::NotInRace,
            RaceError::InvalidParams(_) => ErrorCode::ValidationError,
            RaceError::WordSource(_) => ErrorCode::NoWordlistsAvailable,
        }
    }
}

pub type Result<T> = std::result::Result<T, RaceError>;
