//! Concurrent race store and timer driver.
//!
//! One mutex per race inside a dashmap. The store turns state-machine
//! outcomes into room fan-out and owns the three clocks: the countdown
//! ticker, the time-mode hard timeout, and the words-mode grace window.
//! Every timer captures the race's generation counter at spawn and
//! re-validates status and generation under the lock before acting, so a
//! transition atomically invalidates stale timers.

use crate::code;
use crate::error::{RaceError, Result};
use crate::race::{JoinOutcome, LeaveOutcome, Race, RaceParams};
use chrono::Utc;
use common::{
    race_room, EngineConfig, Fanout, Identity, RaceBeginPayload, RaceCompletedPayload,
    RaceCountdownPayload, RaceMessageReceivedPayload, RacePlayerFinishedPayload,
    RacePlayerPayload, RaceProgressUpdatePayload, RaceResult, RaceStartPayload, RaceStatePayload,
    RaceStatus, ServerMessage, SessionMode,
};
use dashmap::DashMap;
use external_services::{ProviderError, ResultSink, WordRequest, WordSource};
use metrics::{counter, gauge};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_engine::ReferenceText;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Chat message length cap.
const CHAT_MAX_CHARS: usize = 200;

/// Reference text sizing for time mode, tokens per second.
const TOKENS_PER_SECOND: u32 = 3;

/// Sink retry schedule after the initial attempt.
const SINK_RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

pub struct RaceStore {
    races: DashMap<Uuid, Arc<Mutex<Race>>>,
    /// Room-code uniqueness index.
    codes: DashMap<String, Uuid>,
    fanout: Arc<dyn Fanout>,
    words: Arc<dyn WordSource>,
    sink: Arc<dyn ResultSink>,
    config: EngineConfig,
}

impl RaceStore {
    pub fn new(
        fanout: Arc<dyn Fanout>,
        words: Arc<dyn WordSource>,
        sink: Arc<dyn ResultSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            races: DashMap::new(),
            codes: DashMap::new(),
            fanout,
            words,
            sink,
            config,
        }
    }

    pub fn race_count(&self) -> usize {
        self.races.len()
    }

    fn get(&self, race_id: Uuid) -> Result<Arc<Mutex<Race>>> {
        self.races
            .get(&race_id)
            .map(|e| e.clone())
            .ok_or(RaceError::NotFound)
    }

    /// Create a race with the caller as its first player. The reference
    /// text is fetched before anything is installed.
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        creator: Identity,
        name: String,
        mode: SessionMode,
        duration: Option<u32>,
        word_count: Option<u32>,
        max_players: u32,
        word_list_id: Option<String>,
        is_private: bool,
    ) -> Result<RaceStatePayload> {
        let params =
            RaceParams::validate(name, mode, duration, word_count, max_players, is_private)?;
        let token_count = match mode {
            SessionMode::Time => (params.limit * TOKENS_PER_SECOND) as usize,
            SessionMode::Words => params.limit as usize,
        };

        let request = WordRequest {
            list_id: word_list_id,
            language: "en".to_string(),
            count: token_count,
        };
        let tokens = timeout(self.config.word_source_timeout, self.words.fetch(&request))
            .await
            .map_err(|_| {
                RaceError::WordSource(ProviderError::WordListUnavailable(
                    "word source timed out".into(),
                ))
            })??;

        // Room codes are short; retry until one is free.
        let room_code = loop {
            let candidate = code::generate();
            if !self.codes.contains_key(&candidate) {
                break candidate;
            }
        };

        let now_ms = Utc::now().timestamp_millis();
        let mut race = Race::new(
            room_code.clone(),
            params,
            ReferenceText::from_tokens(tokens),
            creator.id.clone(),
            self.config.race_waiting_ttl_ms,
            self.config.race_eviction_delay_ms,
            now_ms,
        );
        race.add_player(creator, now_ms)?;

        let race_id = race.id;
        let payload = RaceStatePayload {
            race: race.summary(),
            players: race.snapshots(),
        };

        info!(race_id = %race_id, code = %room_code, ?mode, limit = payload.race.limit, "race created");
        self.codes.insert(room_code, race_id);
        self.races.insert(race_id, Arc::new(Mutex::new(race)));
        gauge!("engine_active_races").set(self.races.len() as f64);
        counter!("engine_races_created_total").increment(1);

        Ok(payload)
    }

    /// Join a waiting race. Duplicate joins return the current state
    /// without touching the roster.
    pub fn join(
        self: &Arc<Self>,
        race_id: Uuid,
        identity: Identity,
    ) -> Result<RaceStatePayload> {
        let entry = self.get(race_id)?;
        let now_ms = Utc::now().timestamp_millis();

        let (outcome, payload, joined_name, player_count) = {
            let mut race = entry.lock().expect("race lock");
            let outcome = race.add_player(identity.clone(), now_ms)?;
            let payload = RaceStatePayload {
                race: race.summary(),
                players: race.snapshots(),
            };
            let count = race.roster.len();
            (outcome, payload, identity.username.clone(), count)
        };

        if let JoinOutcome::Joined { starts_countdown } = outcome {
            self.fanout.publish(
                &race_room(race_id),
                ServerMessage::RacePlayerJoined(RacePlayerPayload {
                    race_id,
                    identity_id: identity.id.clone(),
                    username: joined_name,
                    player_count,
                }),
            );
            if starts_countdown {
                self.start_countdown(race_id, &entry);
            }
        }
        Ok(payload)
    }

    /// Leave or disconnect. Pre-active departures shrink the roster (and
    /// may downgrade the countdown or cancel the race); active departures
    /// freeze the player for final ranking.
    pub fn leave(self: &Arc<Self>, race_id: Uuid, identity: &Identity) -> Result<LeaveOutcome> {
        let entry = self.get(race_id)?;
        let now_ms = Utc::now().timestamp_millis();

        let (outcome, player_count) = {
            let mut race = entry.lock().expect("race lock");
            let outcome = race.remove_player(&identity.id, now_ms)?;
            (outcome, race.roster.len())
        };

        if outcome.removed || outcome.frozen {
            self.fanout.publish(
                &race_room(race_id),
                ServerMessage::RacePlayerLeft(RacePlayerPayload {
                    race_id,
                    identity_id: identity.id.clone(),
                    username: identity.username.clone(),
                    player_count,
                }),
            );
        }
        if outcome.countdown_cancelled {
            debug!(race_id = %race_id, "countdown cancelled, roster below minimum");
        }
        if outcome.race_cancelled {
            counter!("engine_races_cancelled_total").increment(1);
        }
        Ok(outcome)
    }

    /// Apply a progress report from a roster member and fan the roster
    /// snapshot out.
    pub fn progress(
        self: &Arc<Self>,
        race_id: Uuid,
        identity_id: &str,
        position: usize,
        wpm: f64,
        accuracy: f64,
        errors: u32,
        is_finished: bool,
    ) -> Result<()> {
        let entry = self.get(race_id)?;
        let now_ms = Utc::now().timestamp_millis();

        let (outcome, players, username, mode) = {
            let mut race = entry.lock().expect("race lock");
            let outcome = race.apply_progress(
                identity_id,
                position,
                wpm,
                accuracy,
                errors,
                is_finished,
                now_ms,
            )?;
            let username = race
                .roster
                .get(identity_id)
                .map(|p| p.identity.username.clone())
                .unwrap_or_default();
            (outcome, race.snapshots(), username, race.params.mode)
        };

        if !outcome.changed {
            return Ok(());
        }

        if let Some((rank, finish_time_ms)) = outcome.newly_finished {
            self.fanout.publish(
                &race_room(race_id),
                ServerMessage::RacePlayerFinished(RacePlayerFinishedPayload {
                    race_id,
                    identity_id: identity_id.to_string(),
                    username,
                    rank,
                    finish_time_ms,
                }),
            );
        }

        self.fanout.publish(
            &race_room(race_id),
            ServerMessage::RaceProgressUpdate(RaceProgressUpdatePayload {
                race_id,
                players,
            }),
        );

        if outcome.all_finished {
            self.complete_race(race_id, &entry);
        } else if outcome.first_finisher && mode == SessionMode::Words {
            self.start_grace_window(race_id, &entry);
        }
        Ok(())
    }

    /// Explicit finish report; equivalent to a final progress update at the
    /// end of the text.
    pub fn finish(
        self: &Arc<Self>,
        race_id: Uuid,
        identity_id: &str,
        wpm: f64,
        accuracy: f64,
        errors: u32,
    ) -> Result<()> {
        let position = {
            let entry = self.get(race_id)?;
            let race = entry.lock().expect("race lock");
            race.text.char_count()
        };
        self.progress(race_id, identity_id, position, wpm, accuracy, errors, true)
    }

    /// Validated race chat; fan-out only, nothing persisted.
    pub fn message(
        &self,
        race_id: Uuid,
        identity: &Identity,
        message: &str,
    ) -> Result<()> {
        if message.is_empty() || message.chars().count() > CHAT_MAX_CHARS {
            return Err(RaceError::InvalidParams(format!(
                "message must be 1..={} characters",
                CHAT_MAX_CHARS
            )));
        }
        let entry = self.get(race_id)?;
        {
            let race = entry.lock().expect("race lock");
            if !race.roster.contains_key(&identity.id) {
                return Err(RaceError::NotInRace);
            }
            if race.status.is_terminal() {
                return Err(RaceError::Finished);
            }
        }

        self.fanout.publish(
            &race_room(race_id),
            ServerMessage::RaceMessageReceived(RaceMessageReceivedPayload {
                race_id,
                identity_id: identity.id.clone(),
                username: identity.username.clone(),
                message: message.to_string(),
                sent_at: Utc::now(),
            }),
        );
        Ok(())
    }

    /// Whether an identity is in the roster (spectators are not).
    pub fn is_member(&self, race_id: Uuid, identity_id: &str) -> bool {
        self.races
            .get(&race_id)
            .map(|e| e.lock().expect("race lock").roster.contains_key(identity_id))
            .unwrap_or(false)
    }

    pub fn status_of(&self, race_id: Uuid) -> Option<RaceStatus> {
        self.races
            .get(&race_id)
            .map(|e| e.lock().expect("race lock").status)
    }

    /// Current summary and roster snapshot; what a (re)subscriber is shown.
    pub fn state_of(&self, race_id: Uuid) -> Result<RaceStatePayload> {
        let entry = self.get(race_id)?;
        let race = entry.lock().expect("race lock");
        Ok(RaceStatePayload {
            race: race.summary(),
            players: race.snapshots(),
        })
    }

    /// Periodic sweep: cancel overstaying races and drop evictable ones.
    pub fn sweep(&self) {
        let now_ms = Utc::now().timestamp_millis();
        let mut evict = Vec::new();

        for entry in self.races.iter() {
            let mut race = entry.value().lock().expect("race lock");
            if race.ttl_due(now_ms) {
                race.cancel(now_ms);
                counter!("engine_races_cancelled_total").increment(1);
                info!(race_id = %race.id, "race cancelled by ttl");
            }
            if race.is_evictable(now_ms) {
                evict.push((*entry.key(), race.code.clone()));
            }
        }

        for (id, room_code) in evict {
            self.races.remove(&id);
            self.codes.remove(&room_code);
        }
        gauge!("engine_active_races").set(self.races.len() as f64);
    }

    /// Enter countdown: publish `race:start` with the reference text and
    /// drive one tick per second until `race:begin`.
    fn start_countdown(self: &Arc<Self>, race_id: Uuid, entry: &Arc<Mutex<Race>>) {
        let now_ms = Utc::now().timestamp_millis();
        let (generation, words, text) = {
            let mut race = entry.lock().expect("race lock");
            race.begin_countdown(now_ms);
            (
                race.timer_generation,
                race.text.tokens().to_vec(),
                race.text.joined().to_string(),
            )
        };

        let countdown_ms = self.config.countdown_duration_ms;
        self.fanout.publish(
            &race_room(race_id),
            ServerMessage::RaceStart(RaceStartPayload {
                race_id,
                countdown_ms,
                words,
                text,
            }),
        );

        let store = self.clone();
        let entry = entry.clone();
        tokio::spawn(async move {
            let mut remaining = countdown_ms.div_ceil(1_000) as u32;
            loop {
                sleep(Duration::from_secs(1)).await;
                remaining = remaining.saturating_sub(1);

                let activated = {
                    let mut race = entry.lock().expect("race lock");
                    if race.status != RaceStatus::Countdown
                        || race.timer_generation != generation
                    {
                        // Downgraded or cancelled while we slept.
                        return;
                    }
                    if remaining == 0 {
                        race.activate(Utc::now().timestamp_millis());
                        Some(race.timer_generation)
                    } else {
                        None
                    }
                };

                match activated {
                    None => {
                        store.fanout.publish(
                            &race_room(race_id),
                            ServerMessage::RaceCountdown(RaceCountdownPayload {
                                race_id,
                                seconds_remaining: remaining,
                            }),
                        );
                    }
                    Some(active_generation) => {
                        store.fanout.publish(
                            &race_room(race_id),
                            ServerMessage::RaceBegin(RaceBeginPayload {
                                race_id,
                                started_at: Utc::now(),
                            }),
                        );
                        store.arm_time_limit(race_id, &entry, active_generation);
                        return;
                    }
                }
            }
        });
    }

    /// Time-mode races end on the clock.
    fn arm_time_limit(self: &Arc<Self>, race_id: Uuid, entry: &Arc<Mutex<Race>>, generation: u64) {
        let limit_secs = {
            let race = entry.lock().expect("race lock");
            if race.params.mode != SessionMode::Time {
                return;
            }
            race.params.limit as u64
        };

        let store = self.clone();
        let entry = entry.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(limit_secs)).await;
            let still_active = {
                let race = entry.lock().expect("race lock");
                race.status == RaceStatus::Active && race.timer_generation == generation
            };
            if still_active {
                debug!(race_id = %race_id, "time limit reached");
                store.complete_race(race_id, &entry);
            }
        });
    }

    /// After the first words-mode finisher the rest get a bounded grace
    /// window, then the race is forced to completion.
    fn start_grace_window(self: &Arc<Self>, race_id: Uuid, entry: &Arc<Mutex<Race>>) {
        let now_ms = Utc::now().timestamp_millis();
        let grace_ms = {
            let mut race = entry.lock().expect("race lock");
            let grace = race.grace_window_ms(self.config.finish_grace_cap_ms, now_ms);
            race.grace_deadline_ms = Some(now_ms + grace as i64);
            grace
        };

        debug!(race_id = %race_id, grace_ms, "grace window opened");
        let store = self.clone();
        let entry = entry.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(grace_ms)).await;
            let still_active = {
                let race = entry.lock().expect("race lock");
                race.status == RaceStatus::Active
            };
            if still_active {
                debug!(race_id = %race_id, "grace window expired");
                store.complete_race(race_id, &entry);
            }
        });
    }

    /// Commit completion, publish the final ranking, and hand each player's
    /// record to the sink.
    fn complete_race(self: &Arc<Self>, race_id: Uuid, entry: &Arc<Mutex<Race>>) {
        let now_ms = Utc::now().timestamp_millis();
        let summary = {
            let mut race = entry.lock().expect("race lock");
            match race.complete(self.config.max_wpm_plausibility_ceiling, now_ms) {
                Ok(summary) => summary,
                Err(err) => {
                    // Lost the completion race to another trigger.
                    debug!(race_id = %race_id, %err, "completion skipped");
                    return;
                }
            }
        };

        info!(
            race_id = %race_id,
            players = summary.rankings.len(),
            winner = summary.winner_id.as_deref().unwrap_or("-"),
            "race completed"
        );
        counter!("engine_races_completed_total").increment(1);

        self.fanout.publish_critical(
            &race_room(race_id),
            ServerMessage::RaceCompleted(RaceCompletedPayload {
                race_id,
                rankings: summary.rankings,
                winner_id: summary.winner_id,
                average_wpm: summary.average_wpm,
                duration_ms: summary.duration_ms,
            }),
        );

        self.spawn_sink_delivery(summary.results);
    }

    /// Deliver each record: one attempt plus three retries at 1 s / 2 s /
    /// 4 s, then count and drop.
    fn spawn_sink_delivery(self: &Arc<Self>, results: Vec<RaceResult>) {
        let sink = self.sink.clone();
        let deadline = self.config.result_sink_timeout;
        tokio::spawn(async move {
            for result in results {
                let mut delays = SINK_RETRY_DELAYS.iter();
                loop {
                    match timeout(deadline, sink.record_race(&result)).await {
                        Ok(Ok(())) => break,
                        Ok(Err(err)) => {
                            warn!(race_id = %result.race_id, user = %result.username, %err, "result sink rejected record")
                        }
                        Err(_) => {
                            warn!(race_id = %result.race_id, "result sink call timed out")
                        }
                    }
                    match delays.next() {
                        Some(delay) => sleep(*delay).await,
                        None => {
                            counter!("engine_results_dropped_total").increment(1);
                            warn!(race_id = %result.race_id, user = %result.username, "race result dropped after retries");
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Test hook: drive a race straight to `active`, bypassing the clock.
    #[cfg(test)]
    fn force_activate(&self, race_id: Uuid) {
        let entry = self.get(race_id).unwrap();
        let mut race = entry.lock().unwrap();
        let now_ms = Utc::now().timestamp_millis();
        race.begin_countdown(now_ms);
        race.activate(now_ms);
    }

    /// Test hook: force completion, bypassing the grace and limit clocks.
    #[cfg(test)]
    fn force_complete_for_test(self: &Arc<Self>, race_id: Uuid) {
        let entry = self.get(race_id).unwrap();
        self.complete_race(race_id, &entry);
    }
}
