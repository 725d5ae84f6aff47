//! Result sink implementations.
//!
//! `LogResultSink` is the default wiring when no results backend is
//! configured: it logs the authoritative record and acknowledges.
//! `MemoryResultSink` keeps records in memory with the idempotence contract
//! and is what the engine tests assert against.

use crate::error::{ProviderError, Result};
use crate::traits::ResultSink;
use async_trait::async_trait;
use common::{RaceResult, TestResult};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::info;
use uuid::Uuid;

/// Acknowledges every record after logging it.
pub struct LogResultSink;

#[async_trait]
impl ResultSink for LogResultSink {
    async fn record_test(&self, result: &TestResult) -> Result<()> {
        info!(
            test_id = %result.test_id,
            user = %result.username,
            wpm = result.wpm,
            accuracy = result.accuracy,
            "test result recorded"
        );
        Ok(())
    }

    async fn record_race(&self, result: &RaceResult) -> Result<()> {
        info!(
            race_id = %result.race_id,
            user = %result.username,
            rank = result.rank,
            wpm = result.wpm,
            "race result recorded"
        );
        Ok(())
    }
}

/// In-memory sink, idempotent on `(session id, identity id)`.
#[derive(Default)]
pub struct MemoryResultSink {
    tests: DashMap<(Uuid, Option<String>), TestResult>,
    races: DashMap<(Uuid, String), RaceResult>,
    /// When set, every call fails; used to exercise the engines' retry path.
    fail: AtomicBool,
    /// Number of calls that were told to fail.
    failures: AtomicU64,
}

impl MemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::Relaxed);
    }

    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn test_count(&self) -> usize {
        self.tests.len()
    }

    pub fn race_count(&self) -> usize {
        self.races.len()
    }

    pub fn get_test(&self, test_id: Uuid, identity_id: Option<&str>) -> Option<TestResult> {
        self.tests
            .get(&(test_id, identity_id.map(|s| s.to_string())))
            .map(|r| r.clone())
    }

    pub fn get_race(&self, race_id: Uuid, identity_id: &str) -> Option<RaceResult> {
        self.races
            .get(&(race_id, identity_id.to_string()))
            .map(|r| r.clone())
    }

    fn check_failing(&self) -> Result<()> {
        if self.fail.load(Ordering::Relaxed) {
            self.failures.fetch_add(1, Ordering::Relaxed);
            return Err(ProviderError::SinkUnavailable("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ResultSink for MemoryResultSink {
    async fn record_test(&self, result: &TestResult) -> Result<()> {
        self.check_failing()?;
        // Idempotent: a second record for the same key is a no-op.
        self.tests
            .entry((result.test_id, result.identity_id.clone()))
            .or_insert_with(|| result.clone());
        Ok(())
    }

    async fn record_race(&self, result: &RaceResult) -> Result<()> {
        self.check_failing()?;
        self.races
            .entry((result.race_id, result.identity_id.clone()))
            .or_insert_with(|| result.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::SessionMode;

    fn make_test_result(test_id: Uuid, wpm: u32) -> TestResult {
        TestResult {
            test_id,
            identity_id: Some("u1".to_string()),
            username: "alice".to_string(),
            mode: SessionMode::Time,
            limit: 30,
            wpm,
            raw_wpm: wpm,
            accuracy: 100,
            consistency: 90,
            errors: 0,
            correct_chars: 100,
            incorrect_chars: 0,
            duration_ms: 30_000,
            completed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_idempotent_on_session_and_identity() {
        let sink = MemoryResultSink::new();
        let id = Uuid::new_v4();

        sink.record_test(&make_test_result(id, 80)).await.unwrap();
        // A duplicate with different numbers must not overwrite.
        sink.record_test(&make_test_result(id, 999)).await.unwrap();

        assert_eq!(sink.test_count(), 1);
        assert_eq!(sink.get_test(id, Some("u1")).unwrap().wpm, 80);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let sink = MemoryResultSink::new();
        sink.set_failing(true);
        let err = sink.record_test(&make_test_result(Uuid::new_v4(), 80)).await;
        assert!(err.is_err());
        assert_eq!(sink.failure_count(), 1);
        assert_eq!(sink.test_count(), 0);
    }
}
