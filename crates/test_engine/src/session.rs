//! Test session state machine.
//!
//! Pure state: every method takes the caller's clock (`now_ms`), so the
//! lifecycle is fully deterministic under test. The store drives this from
//! the dispatch path and from timers.

use crate::error::{Result, TestError};
use crate::keystroke::{is_deletion, Keystroke, KeystrokeLog};
use crate::metrics;
use crate::text::ReferenceText;
use chrono::Utc;
use common::{Identity, MetricSnapshot, SessionMode, TestResult, TestStatus};
use tracing::debug;
use uuid::Uuid;

/// What an accepted keystroke caused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    /// The session just transitioned `created → running`.
    pub started: bool,
    /// The stats throttle window has passed; publish a snapshot.
    pub emit_stats: bool,
    /// A completion condition was met; the caller should finalize.
    pub completed: bool,
}

#[derive(Debug)]
pub struct TestSession {
    pub id: Uuid,
    pub owner: Identity,
    /// Connection that started the test; the only one whose keystrokes are
    /// accepted.
    pub owner_connection: Uuid,
    pub mode: SessionMode,
    /// Seconds for time mode, word count for words mode.
    pub limit: u32,
    pub text: ReferenceText,
    pub log: KeystrokeLog,
    pub status: TestStatus,
    pub created_at_ms: i64,
    pub started_at_ms: Option<i64>,
    pub ended_at_ms: Option<i64>,
    /// Server-tracked typing position; the sole input to correctness.
    pub position: usize,
    /// Keystrokes whose client correctness claim disagreed with the server.
    pub claim_divergences: u32,
    pub snapshot: MetricSnapshot,
    last_stats_emit_ms: Option<i64>,
    stats_min_interval_ms: u64,
    ttl_ms: u64,
    /// Set once the session reaches a terminal state.
    pub evict_at_ms: Option<i64>,
}

impl TestSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        owner: Identity,
        owner_connection: Uuid,
        mode: SessionMode,
        limit: u32,
        text: ReferenceText,
        log_cap: usize,
        stats_min_interval_ms: u64,
        ttl_ms: u64,
        now_ms: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner,
            owner_connection,
            mode,
            limit,
            text,
            log: KeystrokeLog::new(log_cap),
            status: TestStatus::Created,
            created_at_ms: now_ms,
            started_at_ms: None,
            ended_at_ms: None,
            position: 0,
            claim_divergences: 0,
            snapshot: MetricSnapshot::default(),
            last_stats_emit_ms: None,
            stats_min_interval_ms,
            ttl_ms,
            evict_at_ms: None,
        }
    }

    /// Milliseconds since the first accepted keystroke.
    pub fn elapsed_ms(&self, now_ms: i64) -> u64 {
        match self.started_at_ms {
            Some(start) => now_ms.saturating_sub(start).max(0) as u64,
            None => 0,
        }
    }

    /// Ingest one keystroke in arrival order.
    ///
    /// Correctness is judged against the reference character at the
    /// server-tracked position; the client's claim is advisory and only
    /// counted when it diverges.
    pub fn ingest(&mut self, key: &str, correct_claim: bool, now_ms: i64) -> Result<IngestOutcome> {
        match self.status {
            TestStatus::Created | TestStatus::Running => {}
            TestStatus::Expired => return Err(TestError::Expired),
            TestStatus::Completed => return Err(TestError::AlreadyCompleted),
        }

        let mut key_chars = key.chars();
        let key_char = key_chars.next().ok_or(TestError::InvalidKey)?;
        if key_chars.next().is_some() {
            return Err(TestError::InvalidKey);
        }

        let started = self.status == TestStatus::Created;
        if started {
            self.started_at_ms = Some(now_ms);
            self.status = TestStatus::Running;
        }

        let ts_ms = self.elapsed_ms(now_ms);
        let correct = if is_deletion(key_char) {
            false
        } else {
            self.text.char_at(self.position) == Some(key_char)
        };

        if !is_deletion(key_char) && correct != correct_claim {
            self.claim_divergences += 1;
            debug!(
                test_id = %self.id,
                position = self.position,
                claimed = correct_claim,
                observed = correct,
                "keystroke correctness claim diverged"
            );
        }

        self.log.push(Keystroke {
            ts_ms,
            key: key_char,
            correct,
            position: self.position,
        });

        if is_deletion(key_char) {
            self.position = self.position.saturating_sub(1);
        } else {
            self.position = (self.position + 1).min(self.text.char_count());
        }

        self.snapshot = metrics::compute(&self.log, self.position, ts_ms);

        let completed = match self.mode {
            SessionMode::Time => ts_ms >= self.limit as u64 * 1_000,
            SessionMode::Words => self.position >= self.text.char_count(),
        };

        let emit_stats = self
            .last_stats_emit_ms
            .map_or(true, |last| now_ms - last >= self.stats_min_interval_ms as i64);
        if emit_stats {
            self.last_stats_emit_ms = Some(now_ms);
        }

        Ok(IngestOutcome {
            started,
            emit_stats,
            completed,
        })
    }

    /// Finalize the session and build the authoritative result.
    pub fn complete(&mut self, eviction_delay_ms: u64, now_ms: i64) -> Result<TestResult> {
        match self.status {
            TestStatus::Created | TestStatus::Running => {}
            TestStatus::Expired => return Err(TestError::Expired),
            TestStatus::Completed => return Err(TestError::AlreadyCompleted),
        }

        let elapsed = self.elapsed_ms(now_ms);
        self.status = TestStatus::Completed;
        self.ended_at_ms = Some(now_ms);
        self.evict_at_ms = Some(now_ms + eviction_delay_ms as i64);
        self.snapshot = metrics::compute(&self.log, self.position, elapsed);

        Ok(TestResult {
            test_id: self.id,
            identity_id: Some(self.owner.id.clone()),
            username: self.owner.username.clone(),
            mode: self.mode,
            limit: self.limit,
            wpm: self.snapshot.wpm,
            raw_wpm: self.snapshot.raw_wpm,
            accuracy: self.snapshot.accuracy,
            consistency: self.snapshot.consistency,
            errors: self.snapshot.errors,
            correct_chars: self.snapshot.correct_chars,
            incorrect_chars: self.snapshot.incorrect_chars,
            duration_ms: elapsed,
            completed_at: Utc::now(),
        })
    }

    /// TTL check; transitions to `expired` when the session overstayed in a
    /// non-terminal state.
    pub fn expire_if_due(&mut self, now_ms: i64) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if now_ms - self.created_at_ms >= self.ttl_ms as i64 {
            self.status = TestStatus::Expired;
            self.ended_at_ms = Some(now_ms);
            self.evict_at_ms = Some(now_ms);
            return true;
        }
        false
    }

    pub fn is_evictable(&self, now_ms: i64) -> bool {
        matches!(self.evict_at_ms, Some(at) if now_ms >= at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_session(mode: SessionMode, limit: u32, tokens: &[&str]) -> TestSession {
        TestSession::new(
            Identity::new("u1", "alice"),
            Uuid::new_v4(),
            mode,
            limit,
            ReferenceText::from_tokens(tokens.iter().map(|t| t.to_string()).collect()),
            10_000,
            100,
            600_000,
            1_000_000,
        )
    }

    /// Type the whole reference text correctly, one stroke per `gap_ms`.
    fn type_text(session: &mut TestSession, gap_ms: i64) -> Vec<IngestOutcome> {
        let text = session.text.joined().to_string();
        text.chars()
            .enumerate()
            .map(|(i, c)| {
                let now = 1_000_000 + i as i64 * gap_ms;
                session.ingest(&c.to_string(), true, now).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_first_keystroke_starts_the_session() {
        let mut session = make_session(SessionMode::Time, 15, &["the", "cat"]);
        assert_eq!(session.status, TestStatus::Created);

        let outcome = session.ingest("t", true, 1_000_000).unwrap();
        assert!(outcome.started);
        assert_eq!(session.status, TestStatus::Running);
        assert_eq!(session.started_at_ms, Some(1_000_000));
    }

    #[test]
    fn test_server_truth_overrides_claim() {
        let mut session = make_session(SessionMode::Time, 15, &["the"]);
        // Client claims correct but 'x' does not match 't'.
        session.ingest("x", true, 1_000_000).unwrap();
        assert_eq!(session.log.correct_count(), 0);
        assert_eq!(session.log.incorrect_count(), 1);
        assert_eq!(session.claim_divergences, 1);
    }

    #[test]
    fn test_multi_char_key_rejected() {
        let mut session = make_session(SessionMode::Time, 15, &["the"]);
        assert!(matches!(
            session.ingest("th", true, 1_000_000),
            Err(TestError::InvalidKey)
        ));
        assert!(matches!(
            session.ingest("", true, 1_000_000),
            Err(TestError::InvalidKey)
        ));
    }

    #[test]
    fn test_deletion_retreats_position() {
        let mut session = make_session(SessionMode::Time, 15, &["the"]);
        session.ingest("t", true, 1_000_000).unwrap();
        assert_eq!(session.position, 1);
        session.ingest("\u{8}", false, 1_000_100).unwrap();
        assert_eq!(session.position, 0);
        // Deletions count neither correct nor incorrect.
        assert_eq!(session.log.typed_count(), 1);
    }

    #[test]
    fn test_words_mode_completes_at_text_end() {
        let mut session = make_session(SessionMode::Words, 2, &["ab", "cd"]);
        let outcomes = type_text(&mut session, 100);
        assert!(outcomes.last().unwrap().completed);
        assert!(!outcomes[outcomes.len() - 2].completed);
    }

    #[test]
    fn test_time_mode_completes_when_limit_elapses() {
        let mut session = make_session(SessionMode::Time, 15, &["the", "cat", "sat"]);
        session.ingest("t", true, 1_000_000).unwrap();
        let outcome = session.ingest("h", true, 1_000_000 + 15_000).unwrap();
        assert!(outcome.completed);
    }

    #[test]
    fn test_fifteen_second_run_yields_48_wpm() {
        // 60 correct keystrokes at one per 100 ms, completed at 15 s.
        let mut session = make_session(
            SessionMode::Time,
            15,
            &["aaaa", "aaaa", "aaaa", "aaaa", "aaaa", "aaaa", "aaaa", "aaaa", "aaaa", "aaaa",
              "aaaa", "aaaa", "aaaa"],
        );
        let text = session.text.joined().to_string();
        for (i, c) in text.chars().take(60).enumerate() {
            let now = 1_000_000 + i as i64 * 100;
            session.ingest(&c.to_string(), true, now).unwrap();
        }
        let result = session.complete(30_000, 1_000_000 + 15_000).unwrap();

        assert_eq!(result.wpm, 48);
        assert_eq!(result.accuracy, 100);
        assert_eq!(result.errors, 0);
        assert_eq!(result.duration_ms, 15_000);
    }

    #[test]
    fn test_complete_twice_is_an_error() {
        let mut session = make_session(SessionMode::Time, 15, &["the"]);
        session.ingest("t", true, 1_000_000).unwrap();
        session.complete(30_000, 1_010_000).unwrap();
        assert!(matches!(
            session.complete(30_000, 1_020_000),
            Err(TestError::AlreadyCompleted)
        ));
    }

    #[test]
    fn test_keystroke_after_completion_rejected() {
        let mut session = make_session(SessionMode::Time, 15, &["the"]);
        session.ingest("t", true, 1_000_000).unwrap();
        session.complete(30_000, 1_010_000).unwrap();
        assert!(matches!(
            session.ingest("h", true, 1_020_000),
            Err(TestError::AlreadyCompleted)
        ));
    }

    #[test]
    fn test_ttl_expiry() {
        let mut session = make_session(SessionMode::Time, 15, &["the"]);
        assert!(!session.expire_if_due(1_000_000 + 599_999));
        assert!(session.expire_if_due(1_000_000 + 600_000));
        assert_eq!(session.status, TestStatus::Expired);
        assert!(session.is_evictable(1_000_000 + 600_000));
        // Expiry is terminal: further keystrokes fail.
        assert!(matches!(
            session.ingest("t", true, 1_000_000 + 600_001),
            Err(TestError::Expired)
        ));
    }

    #[test]
    fn test_stats_emission_throttled() {
        let mut session = make_session(SessionMode::Time, 60, &["aaaa", "aaaa", "aaaa"]);
        let first = session.ingest("a", true, 1_000_000).unwrap();
        assert!(first.emit_stats);
        // 40 ms later: inside the 100 ms window, no emit.
        let second = session.ingest("a", true, 1_000_040).unwrap();
        assert!(!second.emit_stats);
        // 110 ms after the first emit: window passed.
        let third = session.ingest("a", true, 1_000_110).unwrap();
        assert!(third.emit_stats);
    }

    #[test]
    fn test_reference_text_immutable_across_ingestion() {
        let mut session = make_session(SessionMode::Time, 15, &["the", "cat"]);
        let before = session.text.joined().to_string();
        session.ingest("t", true, 1_000_000).unwrap();
        session.ingest("x", false, 1_000_100).unwrap();
        assert_eq!(session.text.joined(), before);
    }
}
