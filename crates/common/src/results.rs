//! Authoritative completion records handed to the result sink.
//!
//! These are built server-side from the observed keystroke log (tests) or
//! the cross-checked roster state (races), never from client-supplied
//! totals. The sink is expected to be idempotent on `(session id,
//! identity id)`.

use crate::messages::SessionMode;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Completed single-player test record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub test_id: Uuid,
    /// None for guest sessions.
    pub identity_id: Option<String>,
    pub username: String,
    pub mode: SessionMode,
    pub limit: u32,
    pub wpm: u32,
    pub raw_wpm: u32,
    pub accuracy: u32,
    pub consistency: u32,
    pub errors: u32,
    pub correct_chars: u32,
    pub incorrect_chars: u32,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

/// One player's completed race record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceResult {
    pub race_id: Uuid,
    pub identity_id: String,
    pub username: String,
    pub mode: SessionMode,
    pub limit: u32,
    pub rank: u32,
    /// Server-validated: capped to the plausibility ceiling.
    pub wpm: u32,
    /// Server-validated: capped to 100.
    pub accuracy: u32,
    pub errors: u32,
    pub finished: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_time_ms: Option<u64>,
    pub completed_at: DateTime<Utc>,
}
