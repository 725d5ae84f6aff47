//! Room fan-out seam.
//!
//! The engines publish domain events without knowing anything about
//! connections or sockets; the gateway's room fabric implements this trait.
//! `publish` must be non-blocking (an enqueue, not a send) so engines can
//! call it while holding an entity lock without stalling a worker.

use crate::messages::ServerMessage;
use uuid::Uuid;

/// Topic-based publish interface with per-room FIFO ordering.
pub trait Fanout: Send + Sync {
    /// Deliver to every current subscriber of `room`, best-effort.
    fn publish(&self, room: &str, message: ServerMessage);

    /// Like `publish` but the message may never be dropped by backpressure;
    /// a subscriber that cannot take it is closed instead.
    fn publish_critical(&self, room: &str, message: ServerMessage);
}

/// Per-user room: presence and personal results land here.
pub fn user_room(identity_id: &str) -> String {
    format!("user:{}", identity_id)
}

/// Per-test room: live stats for the owner and observers.
pub fn test_room(test_id: Uuid) -> String {
    format!("test:{}", test_id)
}

/// Per-race room: roster, countdown, progress, chat.
pub fn race_room(race_id: Uuid) -> String {
    format!("race:{}", race_id)
}
