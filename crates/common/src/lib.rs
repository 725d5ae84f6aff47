//! Shared types for the typerush real-time engine.
//!
//! Everything that crosses a crate boundary lives here: the wire protocol
//! spoken over the WebSocket, the identity model produced by the token
//! verifier, the numeric error taxonomy, authoritative result records, the
//! engine configuration, and the `Fanout` seam the engines publish through.

pub mod config;
pub mod error;
pub mod fanout;
pub mod identity;
pub mod messages;
pub mod results;

pub use config::EngineConfig;
pub use error::{ErrorCode, ErrorPayload};
pub use fanout::{race_room, test_room, user_room, Fanout};
pub use identity::{Identity, PresenceStatus, Role};
pub use messages::*;
pub use results::{RaceResult, TestResult};
