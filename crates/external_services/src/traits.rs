//! Collaborator contracts.
//!
//! Each external system the engine depends on is a trait so the core can be
//! exercised against in-process fakes and deployed against real services
//! without touching engine code.

use crate::error::Result;
use async_trait::async_trait;
use common::{Identity, RaceResult, TestResult};
use std::collections::HashSet;

/// Validates a bearer credential and yields the stable identity it carries.
///
/// The core only validates; issuing and refreshing tokens happens elsewhere.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, bearer: &str) -> Result<Identity>;
}

/// Parameters for a reference-text fetch.
#[derive(Debug, Clone)]
pub struct WordRequest {
    pub list_id: Option<String>,
    pub language: String,
    /// Number of tokens wanted.
    pub count: usize,
}

/// Produces the ordered token sequence a session is judged against.
#[async_trait]
pub trait WordSource: Send + Sync {
    async fn fetch(&self, req: &WordRequest) -> Result<Vec<String>>;
}

/// Receives authoritative completion records.
///
/// Implementations must be idempotent on `(session id, identity id)`; the
/// engine enqueues at most once per terminal transition but may retry on
/// failure.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn record_test(&self, result: &TestResult) -> Result<()>;
    async fn record_race(&self, result: &RaceResult) -> Result<()>;
}

/// Read-only friend-set lookup used for presence fan-out. May be cached.
#[async_trait]
pub trait FriendGraph: Send + Sync {
    async fn friends_of(&self, identity_id: &str) -> HashSet<String>;
}
