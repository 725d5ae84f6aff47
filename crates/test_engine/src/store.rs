//! Concurrent test-session store.
//!
//! One mutex per session inside a dashmap: all mutations of a session are
//! serialized, dispatch may run on any worker. Word-source fetches happen
//! before the session is installed and sink calls after the terminal state
//! is committed, so no collaborator is ever awaited under an entity lock.

use crate::error::{Result, TestError};
use crate::session::TestSession;
use crate::text::ReferenceText;
use chrono::Utc;
use common::{
    test_room, user_room, EngineConfig, Fanout, Identity, ServerMessage, SessionMode,
    TestJoinedPayload, TestResult, TestResultPayload, TestStatsPayload,
};
use dashmap::DashMap;
use external_services::{ProviderError, ResultSink, WordRequest, WordSource};
use metrics::{counter, gauge};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Accepted durations for individual time-mode tests, seconds.
const TIME_MODE_DURATIONS: [u32; 4] = [15, 30, 60, 120];

/// Words-mode count bounds for individual tests.
const WORD_COUNT_MIN: u32 = 10;
const WORD_COUNT_MAX: u32 = 200;

/// Reference text sizing for time mode: tokens per second of test length.
const TOKENS_PER_SECOND: u32 = 3;

/// Sink retry schedule after the initial attempt.
const SINK_RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

pub struct TestStore {
    sessions: DashMap<Uuid, Arc<Mutex<TestSession>>>,
    fanout: Arc<dyn Fanout>,
    words: Arc<dyn WordSource>,
    sink: Arc<dyn ResultSink>,
    config: EngineConfig,
}

impl TestStore {
    pub fn new(
        fanout: Arc<dyn Fanout>,
        words: Arc<dyn WordSource>,
        sink: Arc<dyn ResultSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            fanout,
            words,
            sink,
            config,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Start a new test for `owner`. The reference text is fetched before
    /// anything is installed; a word-source failure leaves no session
    /// behind.
    pub async fn start(
        &self,
        owner: Identity,
        connection_id: Uuid,
        mode: SessionMode,
        duration: Option<u32>,
        word_count: Option<u32>,
        word_list_id: Option<String>,
        language: Option<String>,
    ) -> Result<TestJoinedPayload> {
        let (limit, token_count) = match mode {
            SessionMode::Time => {
                let duration = duration
                    .ok_or_else(|| TestError::InvalidParams("duration required".into()))?;
                if !TIME_MODE_DURATIONS.contains(&duration) {
                    return Err(TestError::InvalidParams(format!(
                        "duration must be one of {:?}",
                        TIME_MODE_DURATIONS
                    )));
                }
                (duration, (duration * TOKENS_PER_SECOND) as usize)
            }
            SessionMode::Words => {
                let count = word_count
                    .ok_or_else(|| TestError::InvalidParams("wordCount required".into()))?;
                if !(WORD_COUNT_MIN..=WORD_COUNT_MAX).contains(&count) {
                    return Err(TestError::InvalidParams(format!(
                        "wordCount must be {}..={}",
                        WORD_COUNT_MIN, WORD_COUNT_MAX
                    )));
                }
                (count, count as usize)
            }
        };

        let request = WordRequest {
            list_id: word_list_id,
            language: language.unwrap_or_else(|| "en".to_string()),
            count: token_count,
        };
        let tokens = timeout(self.config.word_source_timeout, self.words.fetch(&request))
            .await
            .map_err(|_| {
                TestError::WordSource(ProviderError::WordListUnavailable(
                    "word source timed out".into(),
                ))
            })??;

        let session = TestSession::new(
            owner,
            connection_id,
            mode,
            limit,
            ReferenceText::from_tokens(tokens),
            self.config.keystroke_log_cap,
            self.config.stats_broadcast_min_interval_ms,
            self.config.test_session_ttl_ms,
            Utc::now().timestamp_millis(),
        );

        let payload = TestJoinedPayload {
            test_id: session.id,
            mode,
            limit,
            words: session.text.tokens().to_vec(),
            text: session.text.joined().to_string(),
            char_count: session.text.char_count(),
        };

        info!(test_id = %session.id, user = %session.owner.username, ?mode, limit, "test created");
        self.sessions
            .insert(session.id, Arc::new(Mutex::new(session)));
        gauge!("engine_active_tests").set(self.sessions.len() as f64);
        counter!("engine_tests_started_total").increment(1);

        Ok(payload)
    }

    /// Ingest one keystroke from the owning connection.
    pub fn keystroke(
        self: &Arc<Self>,
        test_id: Uuid,
        connection_id: Uuid,
        key: &str,
        correct_claim: bool,
    ) -> Result<()> {
        let entry = self
            .sessions
            .get(&test_id)
            .ok_or(TestError::NotFound)?
            .clone();

        let now_ms = Utc::now().timestamp_millis();
        let (outcome, stats, mode, limit_secs) = {
            let mut session = entry.lock().expect("session lock");
            if session.owner_connection != connection_id {
                return Err(TestError::NotOwner);
            }
            let outcome = session.ingest(key, correct_claim, now_ms)?;
            (outcome, session.snapshot, session.mode, session.limit)
        };

        counter!("engine_keystrokes_total").increment(1);

        if outcome.emit_stats && !outcome.completed {
            self.fanout.publish(
                &test_room(test_id),
                ServerMessage::TestStatsUpdate(TestStatsPayload {
                    test_id,
                    stats,
                }),
            );
        }

        if outcome.started && mode == SessionMode::Time {
            // Time-mode tests end on the clock even if the client stalls.
            let store = self.clone();
            tokio::spawn(async move {
                sleep(Duration::from_secs(limit_secs as u64)).await;
                store.force_complete(test_id);
            });
        }

        if outcome.completed {
            self.finalize(test_id, &entry)?;
        }
        Ok(())
    }

    /// Explicit completion from the owner.
    pub fn complete(self: &Arc<Self>, test_id: Uuid, connection_id: Uuid) -> Result<()> {
        let entry = self
            .sessions
            .get(&test_id)
            .ok_or(TestError::NotFound)?
            .clone();
        {
            let session = entry.lock().expect("session lock");
            if session.owner_connection != connection_id {
                return Err(TestError::NotOwner);
            }
        }
        self.finalize(test_id, &entry)
    }

    /// Clock-driven completion for time mode; a no-op unless the session is
    /// still live.
    pub fn force_complete(self: &Arc<Self>, test_id: Uuid) {
        let Some(entry) = self.sessions.get(&test_id).map(|e| e.clone()) else {
            return;
        };
        if let Err(err) = self.finalize(test_id, &entry) {
            debug!(test_id = %test_id, %err, "clock completion skipped");
        }
    }

    /// Owner walked away; drop the session without a result.
    pub fn leave(&self, test_id: Uuid, connection_id: Uuid) -> Result<()> {
        let entry = self
            .sessions
            .get(&test_id)
            .ok_or(TestError::NotFound)?
            .clone();
        {
            let session = entry.lock().expect("session lock");
            if session.owner_connection != connection_id {
                return Err(TestError::NotOwner);
            }
        }
        self.sessions.remove(&test_id);
        gauge!("engine_active_tests").set(self.sessions.len() as f64);
        info!(test_id = %test_id, "test left");
        Ok(())
    }

    /// Expire any live sessions owned by a connection that went away.
    pub fn handle_disconnect(&self, connection_id: Uuid) {
        let now_ms = Utc::now().timestamp_millis();
        for entry in self.sessions.iter() {
            let mut session = entry.value().lock().expect("session lock");
            if session.owner_connection == connection_id && !session.status.is_terminal() {
                session.status = common::TestStatus::Expired;
                session.evict_at_ms = Some(now_ms);
            }
        }
    }

    /// Periodic sweep: expire overdue sessions and drop evictable ones.
    pub fn sweep(&self) {
        let now_ms = Utc::now().timestamp_millis();
        let mut evict = Vec::new();

        for entry in self.sessions.iter() {
            let mut session = entry.value().lock().expect("session lock");
            if session.expire_if_due(now_ms) {
                counter!("engine_tests_expired_total").increment(1);
                debug!(test_id = %session.id, "test expired");
            }
            if session.is_evictable(now_ms) {
                evict.push(*entry.key());
            }
        }

        for id in evict {
            self.sessions.remove(&id);
        }
        gauge!("engine_active_tests").set(self.sessions.len() as f64);
    }

    /// Commit the terminal state, emit the result exactly once, and hand the
    /// record to the sink with bounded retry.
    fn finalize(self: &Arc<Self>, test_id: Uuid, entry: &Arc<Mutex<TestSession>>) -> Result<()> {
        let now_ms = Utc::now().timestamp_millis();
        let (result, owner_id) = {
            let mut session = entry.lock().expect("session lock");
            let result = session.complete(self.config.test_eviction_delay_ms, now_ms)?;
            (result, session.owner.id.clone())
        };

        info!(
            test_id = %test_id,
            wpm = result.wpm,
            accuracy = result.accuracy,
            "test completed"
        );
        counter!("engine_tests_completed_total").increment(1);

        let message = ServerMessage::TestResult(TestResultPayload {
            result: result.clone(),
        });
        self.fanout
            .publish_critical(&user_room(&owner_id), message.clone());
        self.fanout.publish_critical(&test_room(test_id), message);

        self.spawn_sink_delivery(result);
        Ok(())
    }

    /// Deliver to the sink: one attempt plus three retries at 1 s / 2 s /
    /// 4 s, then count and drop.
    fn spawn_sink_delivery(self: &Arc<Self>, result: TestResult) {
        let sink = self.sink.clone();
        let deadline = self.config.result_sink_timeout;
        tokio::spawn(async move {
            let mut delays = SINK_RETRY_DELAYS.iter();
            loop {
                match timeout(deadline, sink.record_test(&result)).await {
                    Ok(Ok(())) => return,
                    Ok(Err(err)) => {
                        warn!(test_id = %result.test_id, %err, "result sink rejected record")
                    }
                    Err(_) => warn!(test_id = %result.test_id, "result sink call timed out"),
                }
                match delays.next() {
                    Some(delay) => sleep(*delay).await,
                    None => {
                        counter!("engine_results_dropped_total").increment(1);
                        warn!(test_id = %result.test_id, "result dropped after retries");
                        return;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use external_services::{BuiltinWordSource, MemoryResultSink};
    use std::sync::Mutex as StdMutex;

    /// Fan-out double that records every publish in order.
    #[derive(Default)]
    struct CaptureFanout {
        published: StdMutex<Vec<(String, ServerMessage)>>,
    }

    impl CaptureFanout {
        fn messages(&self) -> Vec<(String, ServerMessage)> {
            self.published.lock().unwrap().clone()
        }
    }

    impl Fanout for CaptureFanout {
        fn publish(&self, room: &str, message: ServerMessage) {
            self.published
                .lock()
                .unwrap()
                .push((room.to_string(), message));
        }

        fn publish_critical(&self, room: &str, message: ServerMessage) {
            self.publish(room, message);
        }
    }

    fn make_store() -> (Arc<TestStore>, Arc<CaptureFanout>, Arc<MemoryResultSink>) {
        let fanout = Arc::new(CaptureFanout::default());
        let sink = Arc::new(MemoryResultSink::new());
        let store = Arc::new(TestStore::new(
            fanout.clone(),
            Arc::new(BuiltinWordSource::new()),
            sink.clone(),
            EngineConfig::default(),
        ));
        (store, fanout, sink)
    }

    fn alice() -> Identity {
        Identity::new("u1", "alice")
    }

    #[tokio::test]
    async fn test_start_sizes_time_mode_text() {
        let (store, _, _) = make_store();
        let joined = store
            .start(alice(), Uuid::new_v4(), SessionMode::Time, Some(15), None, None, None)
            .await
            .unwrap();
        assert_eq!(joined.words.len(), 45);
        assert_eq!(joined.limit, 15);
        assert_eq!(store.session_count(), 1);
    }

    #[tokio::test]
    async fn test_start_rejects_off_menu_duration() {
        let (store, _, _) = make_store();
        let err = store
            .start(alice(), Uuid::new_v4(), SessionMode::Time, Some(45), None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TestError::InvalidParams(_)));
        assert_eq!(store.session_count(), 0);
    }

    #[tokio::test]
    async fn test_word_source_failure_installs_nothing() {
        let (store, _, _) = make_store();
        let err = store
            .start(
                alice(),
                Uuid::new_v4(),
                SessionMode::Words,
                None,
                Some(20),
                Some("missing-list".to_string()),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TestError::WordSource(_)));
        assert_eq!(store.session_count(), 0);
    }

    #[tokio::test]
    async fn test_keystrokes_only_from_owner_connection() {
        let (store, _, _) = make_store();
        let owner_conn = Uuid::new_v4();
        let joined = store
            .start(alice(), owner_conn, SessionMode::Words, None, Some(10), None, None)
            .await
            .unwrap();

        let other_conn = Uuid::new_v4();
        let err = store
            .keystroke(joined.test_id, other_conn, "a", true)
            .unwrap_err();
        assert!(matches!(err, TestError::NotOwner));
    }

    #[tokio::test]
    async fn test_words_run_produces_exactly_one_result() {
        let (store, fanout, sink) = make_store();
        let conn = Uuid::new_v4();
        let joined = store
            .start(alice(), conn, SessionMode::Words, None, Some(10), None, None)
            .await
            .unwrap();

        for c in joined.text.chars() {
            store
                .keystroke(joined.test_id, conn, &c.to_string(), true)
                .unwrap();
        }

        // Let the sink delivery task run.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(sink.test_count(), 1);
        let recorded = sink.get_test(joined.test_id, Some("u1")).unwrap();
        assert_eq!(recorded.accuracy, 100);
        assert_eq!(recorded.errors, 0);
        assert!(recorded.wpm <= 300 || recorded.duration_ms < 1_000);

        let results: Vec<_> = fanout
            .messages()
            .into_iter()
            .filter(|(_, m)| matches!(m, ServerMessage::TestResult(_)))
            .collect();
        // One emit to the owner room and one to the test room, same terminal
        // transition.
        assert_eq!(results.len(), 2);
        assert!(results.iter().any(|(room, _)| room == "user:u1"));

        // A second explicit completion must not produce another result.
        let err = store.complete(joined.test_id, conn).unwrap_err();
        assert!(matches!(err, TestError::AlreadyCompleted));
    }

    #[tokio::test]
    async fn test_sink_failure_still_emits_result_to_client() {
        let (store, fanout, sink) = make_store();
        sink.set_failing(true);
        let conn = Uuid::new_v4();
        let joined = store
            .start(alice(), conn, SessionMode::Words, None, Some(10), None, None)
            .await
            .unwrap();

        for c in joined.text.chars() {
            store
                .keystroke(joined.test_id, conn, &c.to_string(), true)
                .unwrap();
        }

        let results = fanout
            .messages()
            .into_iter()
            .filter(|(_, m)| matches!(m, ServerMessage::TestResult(_)))
            .count();
        assert_eq!(results, 2);
        assert_eq!(sink.test_count(), 0);
    }

    #[tokio::test]
    async fn test_leave_drops_the_session() {
        let (store, _, sink) = make_store();
        let conn = Uuid::new_v4();
        let joined = store
            .start(alice(), conn, SessionMode::Words, None, Some(10), None, None)
            .await
            .unwrap();

        store.leave(joined.test_id, conn).unwrap();
        assert_eq!(store.session_count(), 0);
        assert_eq!(sink.test_count(), 0);
        assert!(matches!(
            store.keystroke(joined.test_id, conn, "a", true),
            Err(TestError::NotFound)
        ));
    }
}
