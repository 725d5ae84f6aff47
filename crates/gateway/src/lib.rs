//! WebSocket gateway for the typerush real-time engine.
//!
//! This crate is the entry point of the system:
//! - Accepts WebSocket connections and gates them through the token
//!   verifier
//! - Registers connections (multi-connection per identity, capped)
//! - Runs the room fabric: named rooms with per-room FIFO fan-out and
//!   bounded per-connection send queues
//! - Enforces per-event token-bucket rate limits
//! - Dispatches typed inbound events to the test and race engines
//! - Announces presence to friends and answers pings
//!
//! ## Architecture
//!
//! ```text
//! WebSocket client
//!         ↓ inbound frame
//! SessionRouter (rate check → schema validation → engine call)
//!         ↓ domain events
//! TestStore / RaceStore
//!         ↓ publish
//! RoomFabric (per-room FIFO)
//!         ↓ bounded SendQueue per connection
//! WebSocket clients
//! ```

pub mod auth;
pub mod client;
pub mod error;
pub mod housekeeping;
pub mod outbound;
pub mod presence;
pub mod ratelimit;
pub mod rooms;
pub mod router;
pub mod ws_server;

pub use auth::AuthGate;
pub use client::{Connection, ConnectionRegistry};
pub use error::{GatewayError, Result};
pub use outbound::{CloseReason, PushOutcome, SendQueue};
pub use presence::PresenceTracker;
pub use ratelimit::{Decision, RateClass, RateGovernor};
pub use rooms::RoomFabric;
pub use router::SessionRouter;
pub use ws_server::{create_router, AppState};
