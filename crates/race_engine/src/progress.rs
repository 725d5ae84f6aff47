//! Per-player race progress.
//!
//! Lives inside its race's roster and is mutated only by the race engine.
//! Holds no back-reference to the race.

use common::{Identity, PlayerSnapshot};

#[derive(Debug, Clone)]
pub struct PlayerProgress {
    pub identity: Identity,
    pub joined_at_ms: i64,
    /// Characters typed into the reference text.
    pub position: usize,
    /// Live values as reported by the client; used for fan-out only. The
    /// persisted record is recomputed server-side at completion.
    pub wpm: u32,
    pub accuracy: u32,
    pub errors: u32,
    pub finished: bool,
    /// Milliseconds since race start; assigned exactly once.
    pub finish_time_ms: Option<u64>,
    /// Provisional rank assigned on finish; final ranks are recomputed at
    /// race completion.
    pub rank: Option<u32>,
    /// Cleared when the player's connection drops mid-race; their progress
    /// freezes but the roster slot survives until completion.
    pub connected: bool,
}

impl PlayerProgress {
    pub fn new(identity: Identity, joined_at_ms: i64) -> Self {
        Self {
            identity,
            joined_at_ms,
            position: 0,
            wpm: 0,
            accuracy: 100,
            errors: 0,
            finished: false,
            finish_time_ms: None,
            rank: None,
            connected: true,
        }
    }

    pub fn snapshot(&self) -> PlayerSnapshot {
        PlayerSnapshot {
            identity_id: self.identity.id.clone(),
            username: self.identity.username.clone(),
            position: self.position,
            wpm: self.wpm,
            accuracy: self.accuracy,
            errors: self.errors,
            finished: self.finished,
            finish_time_ms: self.finish_time_ms,
            rank: self.rank,
            connected: self.connected,
        }
    }
}
