//! Collaborator contracts the engine consumes, plus in-process
//! implementations.
//!
//! The core never talks to the account system, word-list storage, or the
//! results database directly; it goes through the four traits in
//! [`traits`]. The bundled implementations here are what the binary wires
//! up by default: an HMAC token verifier, an embedded word bank, a logging
//! result sink, and a static friend graph. Deployments with real backing
//! services implement the same traits elsewhere.

pub mod error;
pub mod friends;
pub mod sink;
pub mod token;
pub mod traits;
pub mod words;

pub use error::{ProviderError, Result};
pub use friends::StaticFriendGraph;
pub use sink::{LogResultSink, MemoryResultSink};
pub use token::HmacTokenVerifier;
pub use traits::{FriendGraph, ResultSink, TokenVerifier, WordRequest, WordSource};
pub use words::BuiltinWordSource;
