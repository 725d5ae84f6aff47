//! Multiplayer race engine.
//!
//! Owns the race lifecycle (`waiting → countdown → active → completed`,
//! with cancellation from the pre-active states), the per-player roster,
//! provisional and final ranking, and the countdown / grace-window /
//! timeout clocks.
//!
//! The state machine in [`race`] is pure (methods take `now_ms`); the
//! [`store::RaceStore`] adds the concurrent map, the fan-out to race rooms,
//! the tokio timer tasks, and result-sink delivery. Timers re-validate the
//! race status and a generation counter on every tick, so a transition
//! atomically invalidates any timer that observed the older state.

pub mod code;
pub mod error;
pub mod progress;
pub mod race;
pub mod store;

pub use error::{RaceError, Result};
pub use progress::PlayerProgress;
pub use race::{CompletionSummary, JoinOutcome, LeaveOutcome, ProgressOutcome, Race, RaceParams};
pub use store::RaceStore;
