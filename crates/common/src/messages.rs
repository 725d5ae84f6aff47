//! WebSocket protocol message types.
//!
//! Every message on the wire is a JSON object with a top-level `type` event
//! name and a `payload` object. Inbound payloads are strictly typed: missing
//! required fields fail deserialization (and surface as a validation error),
//! unknown fields are ignored. Outbound frames additionally carry a server
//! `timestamp`.

use crate::error::ErrorPayload;
use crate::identity::PresenceStatus;
use crate::results::TestResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Test/race pacing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Fixed duration in seconds; the reference text is sized to outlast it.
    Time,
    /// Fixed word count; the session ends when the text is exhausted.
    Words,
}

/// Single-player test lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Created,
    Running,
    Completed,
    Expired,
}

impl TestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TestStatus::Completed | TestStatus::Expired)
    }
}

/// Multiplayer race lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaceStatus {
    Waiting,
    Countdown,
    Active,
    Completed,
    Cancelled,
}

impl RaceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RaceStatus::Completed | RaceStatus::Cancelled)
    }

    /// Position in the one-way lifecycle, used to reject regressions.
    pub fn order(self) -> u8 {
        match self {
            RaceStatus::Waiting => 0,
            RaceStatus::Countdown => 1,
            RaceStatus::Active => 2,
            RaceStatus::Completed | RaceStatus::Cancelled => 3,
        }
    }
}

// ============================================================================
// Client → Server Messages
// ============================================================================

/// Message sent from client to server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    #[serde(rename = "test:start")]
    TestStart(TestStartPayload),
    #[serde(rename = "test:keystroke")]
    TestKeystroke(TestKeystrokePayload),
    #[serde(rename = "test:completed")]
    TestCompleted(TestCompletedPayload),
    #[serde(rename = "test:leave")]
    TestLeave(TestLeavePayload),
    #[serde(rename = "race:create")]
    RaceCreate(RaceCreatePayload),
    #[serde(rename = "race:join")]
    RaceJoin(RaceRefPayload),
    #[serde(rename = "race:leave")]
    RaceLeave(RaceRefPayload),
    #[serde(rename = "race:progress")]
    RaceProgress(RaceProgressPayload),
    #[serde(rename = "race:finish")]
    RaceFinish(RaceFinishPayload),
    #[serde(rename = "race:message")]
    RaceMessage(RaceMessagePayload),
    #[serde(rename = "friends:update_status")]
    FriendsUpdateStatus(UpdateStatusPayload),
    #[serde(rename = "ping")]
    Ping,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestStartPayload {
    pub mode: SessionMode,
    /// Seconds; required for time mode.
    pub duration: Option<u32>,
    /// Required for words mode.
    pub word_count: Option<u32>,
    pub word_list_id: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestKeystrokePayload {
    pub test_id: Uuid,
    /// Milliseconds since the client's session start; advisory only.
    pub timestamp: u64,
    /// Exactly one character.
    pub key: String,
    /// Client-side correctness claim; the server recomputes its own.
    pub correct: bool,
    /// Client-side text position; advisory only.
    pub position: usize,
    pub current_text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCompletedPayload {
    pub test_id: Uuid,
    pub final_stats: FinalStats,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestLeavePayload {
    pub test_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceCreatePayload {
    pub name: String,
    pub mode: SessionMode,
    pub duration: Option<u32>,
    pub word_count: Option<u32>,
    pub max_players: u32,
    pub word_list_id: Option<String>,
    #[serde(default)]
    pub is_private: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceRefPayload {
    pub race_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceProgressPayload {
    pub race_id: Uuid,
    pub position: usize,
    pub wpm: f64,
    pub accuracy: f64,
    pub errors: u32,
    #[serde(default)]
    pub is_finished: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceFinishPayload {
    pub race_id: Uuid,
    pub final_stats: FinalStats,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceMessagePayload {
    pub race_id: Uuid,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatusPayload {
    pub status: PresenceStatus,
    pub activity: Option<String>,
}

/// Client-reported final statistics. Advisory: the persisted record is
/// recomputed server-side and cross-checked for plausibility.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalStats {
    pub wpm: f64,
    pub accuracy: f64,
    pub consistency: Option<f64>,
    pub errors: u32,
    /// Milliseconds; present on test completion.
    pub time_elapsed: Option<u64>,
    /// Milliseconds since race start; present on race finish.
    pub finish_time: Option<u64>,
}

// ============================================================================
// Server → Client Messages
// ============================================================================

/// Message sent from server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename = "test:joined")]
    TestJoined(TestJoinedPayload),
    #[serde(rename = "test:stats_update")]
    TestStatsUpdate(TestStatsPayload),
    #[serde(rename = "test:result")]
    TestResult(TestResultPayload),
    #[serde(rename = "race:created")]
    RaceCreated(RaceStatePayload),
    #[serde(rename = "race:joined")]
    RaceJoined(RaceStatePayload),
    #[serde(rename = "race:player_joined")]
    RacePlayerJoined(RacePlayerPayload),
    #[serde(rename = "race:player_left")]
    RacePlayerLeft(RacePlayerPayload),
    #[serde(rename = "race:start")]
    RaceStart(RaceStartPayload),
    #[serde(rename = "race:countdown")]
    RaceCountdown(RaceCountdownPayload),
    #[serde(rename = "race:begin")]
    RaceBegin(RaceBeginPayload),
    #[serde(rename = "race:progress_update")]
    RaceProgressUpdate(RaceProgressUpdatePayload),
    #[serde(rename = "race:player_finished")]
    RacePlayerFinished(RacePlayerFinishedPayload),
    #[serde(rename = "race:completed")]
    RaceCompleted(RaceCompletedPayload),
    #[serde(rename = "race:message_received")]
    RaceMessageReceived(RaceMessageReceivedPayload),
    #[serde(rename = "friend:online")]
    FriendOnline(FriendPresencePayload),
    #[serde(rename = "friend:offline")]
    FriendPresenceOffline(FriendPresencePayload),
    #[serde(rename = "error")]
    Error(ErrorPayload),
    #[serde(rename = "pong")]
    Pong,
}

impl ServerMessage {
    /// Critical messages may never be silently dropped by backpressure; the
    /// subscriber is closed instead.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            ServerMessage::TestResult(_) | ServerMessage::RaceCompleted(_)
        )
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestJoinedPayload {
    pub test_id: Uuid,
    pub mode: SessionMode,
    /// Seconds for time mode, word count for words mode.
    pub limit: u32,
    pub words: Vec<String>,
    /// Space-joined reference text the client renders and is judged against.
    pub text: String,
    pub char_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestStatsPayload {
    pub test_id: Uuid,
    pub stats: MetricSnapshot,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResultPayload {
    pub result: TestResult,
}

/// Live typing metrics, recomputed server-side from the keystroke log.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MetricSnapshot {
    pub wpm: u32,
    pub raw_wpm: u32,
    /// Percent, 0..=100.
    pub accuracy: u32,
    /// Percent, 0..=100.
    pub consistency: u32,
    pub errors: u32,
    pub correct_chars: u32,
    pub incorrect_chars: u32,
    pub position: usize,
    pub elapsed_ms: u64,
}

/// Race summary shared on create/join and in lobby listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceSummary {
    pub race_id: Uuid,
    pub code: String,
    pub name: String,
    pub mode: SessionMode,
    pub limit: u32,
    pub max_players: u32,
    pub player_count: usize,
    pub status: RaceStatus,
    pub is_private: bool,
    pub created_by: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceStatePayload {
    pub race: RaceSummary,
    pub players: Vec<PlayerSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RacePlayerPayload {
    pub race_id: Uuid,
    pub identity_id: String,
    pub username: String,
    pub player_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceStartPayload {
    pub race_id: Uuid,
    pub countdown_ms: u64,
    pub words: Vec<String>,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceCountdownPayload {
    pub race_id: Uuid,
    pub seconds_remaining: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceBeginPayload {
    pub race_id: Uuid,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceProgressUpdatePayload {
    pub race_id: Uuid,
    pub players: Vec<PlayerSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RacePlayerFinishedPayload {
    pub race_id: Uuid,
    pub identity_id: String,
    pub username: String,
    /// Provisional rank at finish time; final ranking is published with
    /// `race:completed`.
    pub rank: u32,
    pub finish_time_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceCompletedPayload {
    pub race_id: Uuid,
    /// Final ranking, rank 1 first.
    pub rankings: Vec<PlayerSnapshot>,
    pub winner_id: Option<String>,
    pub average_wpm: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceMessageReceivedPayload {
    pub race_id: Uuid,
    pub identity_id: String,
    pub username: String,
    pub message: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendPresencePayload {
    pub identity_id: String,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<PresenceStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
}

/// Per-player progress snapshot as fanned out to a race room.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSnapshot {
    pub identity_id: String,
    pub username: String,
    pub position: usize,
    pub wpm: u32,
    pub accuracy: u32,
    pub errors: u32,
    pub finished: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank: Option<u32>,
    pub connected: bool,
}

// ============================================================================
// Outbound framing
// ============================================================================

/// Wire frame for server → client messages: the tagged message plus a server
/// timestamp at the top level.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundFrame {
    #[serde(flatten)]
    pub message: ServerMessage,
    pub timestamp: DateTime<Utc>,
}

impl OutboundFrame {
    pub fn new(message: ServerMessage) -> Self {
        Self {
            message,
            timestamp: Utc::now(),
        }
    }
}
