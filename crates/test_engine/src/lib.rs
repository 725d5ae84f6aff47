//! Single-player typing-test engine.
//!
//! Owns the test session lifecycle (`created → running → completed |
//! expired`), the server-side keystroke log, and the derived metrics
//! pipeline. Every metric published for a session is recomputed from the
//! keystrokes this engine observed; client-supplied totals are advisory.
//!
//! Session state is pure and clock-free (methods take `now_ms`), so the
//! state machine is tested without timers. The [`store::TestStore`] layers
//! the concurrent map, the word-source fetch, stats fan-out, the time-mode
//! completion timer, and the result-sink retry on top.

pub mod error;
pub mod keystroke;
pub mod metrics;
pub mod session;
pub mod store;
pub mod text;

pub use error::{Result, TestError};
pub use keystroke::{Keystroke, KeystrokeLog};
pub use session::{IngestOutcome, TestSession};
pub use store::TestStore;
pub use text::ReferenceText;
