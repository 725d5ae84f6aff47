//! Race state machine.
//!
//! Pure state: methods take the caller's clock (`now_ms`) and return
//! outcome values the store turns into fan-out and timers. The lifecycle is
//! one-way (`waiting → countdown → active → completed|cancelled`) with a
//! single sanctioned rollback: a countdown whose roster drops below the
//! minimum returns to `waiting`.

use crate::error::{RaceError, Result};
use crate::progress::PlayerProgress;
use common::{
    Identity, PlayerSnapshot, RaceResult, RaceStatus, RaceSummary, SessionMode,
};
use chrono::Utc;
use std::collections::BTreeMap;
use test_engine::metrics;
use test_engine::ReferenceText;
use tracing::{debug, error};
use uuid::Uuid;

/// Validation bounds for race creation.
const NAME_MAX_CHARS: usize = 50;
const DURATION_SECS: std::ops::RangeInclusive<u32> = 15..=300;
const WORD_COUNT: std::ops::RangeInclusive<u32> = 10..=200;
const MAX_PLAYERS: std::ops::RangeInclusive<u32> = 2..=20;

/// Roster size at which the countdown starts.
pub const MIN_PLAYERS: u32 = 2;

/// Validated creation parameters.
#[derive(Debug, Clone)]
pub struct RaceParams {
    pub name: String,
    pub mode: SessionMode,
    /// Seconds for time mode, word count for words mode.
    pub limit: u32,
    pub max_players: u32,
    pub is_private: bool,
}

impl RaceParams {
    pub fn validate(
        name: String,
        mode: SessionMode,
        duration: Option<u32>,
        word_count: Option<u32>,
        max_players: u32,
        is_private: bool,
    ) -> Result<Self> {
        if name.is_empty() || name.chars().count() > NAME_MAX_CHARS {
            return Err(RaceError::InvalidParams(format!(
                "name must be 1..={} characters",
                NAME_MAX_CHARS
            )));
        }
        if !MAX_PLAYERS.contains(&max_players) {
            return Err(RaceError::InvalidParams(format!(
                "maxPlayers must be {}..={}",
                MAX_PLAYERS.start(),
                MAX_PLAYERS.end()
            )));
        }
        let limit = match mode {
            SessionMode::Time => {
                let duration = duration
                    .ok_or_else(|| RaceError::InvalidParams("duration required".into()))?;
                if !DURATION_SECS.contains(&duration) {
                    return Err(RaceError::InvalidParams(format!(
                        "duration must be {}..={} seconds",
                        DURATION_SECS.start(),
                        DURATION_SECS.end()
                    )));
                }
                duration
            }
            SessionMode::Words => {
                let count = word_count
                    .ok_or_else(|| RaceError::InvalidParams("wordCount required".into()))?;
                if !WORD_COUNT.contains(&count) {
                    return Err(RaceError::InvalidParams(format!(
                        "wordCount must be {}..={}",
                        WORD_COUNT.start(),
                        WORD_COUNT.end()
                    )));
                }
                count
            }
        };
        Ok(Self {
            name,
            mode,
            limit,
            max_players,
            is_private,
        })
    }
}

/// What a join did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined { starts_countdown: bool },
    /// Duplicate join: a no-op that returns the joined state.
    AlreadyPresent,
}

/// What a leave/disconnect did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub removed: bool,
    /// Roster dropped below the minimum during countdown.
    pub countdown_cancelled: bool,
    /// Roster emptied before the race went active.
    pub race_cancelled: bool,
    /// Mid-race departure: progress frozen, slot kept for final ranking.
    pub frozen: bool,
}

/// What a progress update did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressOutcome {
    pub changed: bool,
    /// Provisional rank and finish time when this update finished the
    /// player.
    pub newly_finished: Option<(u32, u64)>,
    /// This update produced the race's first finisher.
    pub first_finisher: bool,
    pub all_finished: bool,
}

/// Everything `race:completed` and the result sink need.
#[derive(Debug, Clone)]
pub struct CompletionSummary {
    pub rankings: Vec<PlayerSnapshot>,
    pub results: Vec<RaceResult>,
    pub winner_id: Option<String>,
    pub average_wpm: u32,
    pub duration_ms: u64,
}

#[derive(Debug)]
pub struct Race {
    pub id: Uuid,
    /// Shareable 6-character room code.
    pub code: String,
    pub params: RaceParams,
    pub text: ReferenceText,
    /// Identity id → progress. Ordered map so iteration (and therefore tie
    /// breaking) is deterministic.
    pub roster: BTreeMap<String, PlayerProgress>,
    pub status: RaceStatus,
    pub created_by: String,
    pub created_at_ms: i64,
    pub countdown_started_at_ms: Option<i64>,
    pub started_at_ms: Option<i64>,
    pub ended_at_ms: Option<i64>,
    /// Bumped on every transition that invalidates running timers; a timer
    /// that observes a stale generation exits without acting.
    pub timer_generation: u64,
    pub grace_deadline_ms: Option<i64>,
    pub evict_at_ms: Option<i64>,
    waiting_ttl_ms: u64,
    eviction_delay_ms: u64,
}

impl Race {
    pub fn new(
        code: String,
        params: RaceParams,
        text: ReferenceText,
        created_by: String,
        waiting_ttl_ms: u64,
        eviction_delay_ms: u64,
        now_ms: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            code,
            params,
            text,
            roster: BTreeMap::new(),
            status: RaceStatus::Waiting,
            created_by,
            created_at_ms: now_ms,
            countdown_started_at_ms: None,
            started_at_ms: None,
            ended_at_ms: None,
            timer_generation: 0,
            grace_deadline_ms: None,
            evict_at_ms: None,
            waiting_ttl_ms,
            eviction_delay_ms,
        }
    }

    pub fn summary(&self) -> RaceSummary {
        RaceSummary {
            race_id: self.id,
            code: self.code.clone(),
            name: self.params.name.clone(),
            mode: self.params.mode,
            limit: self.params.limit,
            max_players: self.params.max_players,
            player_count: self.roster.len(),
            status: self.status,
            is_private: self.params.is_private,
            created_by: self.created_by.clone(),
        }
    }

    pub fn snapshots(&self) -> Vec<PlayerSnapshot> {
        self.roster.values().map(|p| p.snapshot()).collect()
    }

    fn finished_count(&self) -> u32 {
        self.roster.values().filter(|p| p.finished).count() as u32
    }

    /// One-way transition. Regression is an engine bug: it fails fast in
    /// debug builds and is ignored in release.
    fn transition(&mut self, next: RaceStatus) {
        if next.order() < self.status.order() {
            debug_assert!(
                false,
                "race status regression: {:?} -> {:?}",
                self.status, next
            );
            error!(race_id = %self.id, from = ?self.status, to = ?next, "ignored status regression");
            return;
        }
        debug!(race_id = %self.id, from = ?self.status, to = ?next, "race transition");
        self.status = next;
    }

    /// Add a player. Only possible while waiting; duplicate joins are
    /// no-ops.
    pub fn add_player(&mut self, identity: Identity, now_ms: i64) -> Result<JoinOutcome> {
        if self.roster.contains_key(&identity.id) {
            return Ok(JoinOutcome::AlreadyPresent);
        }
        match self.status {
            RaceStatus::Waiting => {}
            RaceStatus::Countdown | RaceStatus::Active => return Err(RaceError::AlreadyStarted),
            RaceStatus::Completed | RaceStatus::Cancelled => return Err(RaceError::Finished),
        }
        if self.roster.len() as u32 >= self.params.max_players {
            return Err(RaceError::Full);
        }

        let starts_countdown = {
            self.roster
                .insert(identity.id.clone(), PlayerProgress::new(identity, now_ms));
            self.roster.len() as u32 >= MIN_PLAYERS
        };
        Ok(JoinOutcome::Joined { starts_countdown })
    }

    /// Enter countdown. The store publishes `race:start` and drives the
    /// tick clock.
    pub fn begin_countdown(&mut self, now_ms: i64) {
        self.transition(RaceStatus::Countdown);
        self.countdown_started_at_ms = Some(now_ms);
        self.timer_generation += 1;
    }

    /// The sanctioned rollback: roster dropped below the minimum while
    /// counting down, so the race returns to `waiting` and the countdown
    /// clock dies.
    fn cancel_countdown(&mut self) {
        debug!(race_id = %self.id, "countdown cancelled, back to waiting");
        self.status = RaceStatus::Waiting;
        self.countdown_started_at_ms = None;
        self.timer_generation += 1;
    }

    /// Countdown reached zero.
    pub fn activate(&mut self, now_ms: i64) {
        self.transition(RaceStatus::Active);
        self.started_at_ms = Some(now_ms);
        self.timer_generation += 1;
    }

    /// Remove (pre-active) or freeze (active) a player.
    pub fn remove_player(&mut self, identity_id: &str, now_ms: i64) -> Result<LeaveOutcome> {
        if !self.roster.contains_key(identity_id) {
            return Err(RaceError::NotInRace);
        }
        let mut outcome = LeaveOutcome::default();
        match self.status {
            RaceStatus::Waiting | RaceStatus::Countdown => {
                self.roster.remove(identity_id);
                outcome.removed = true;
                if self.roster.is_empty() {
                    self.cancel(now_ms);
                    outcome.race_cancelled = true;
                } else if self.status == RaceStatus::Countdown
                    && (self.roster.len() as u32) < MIN_PLAYERS
                {
                    self.cancel_countdown();
                    outcome.countdown_cancelled = true;
                }
            }
            RaceStatus::Active => {
                let player = self.roster.get_mut(identity_id).expect("checked above");
                player.connected = false;
                outcome.frozen = true;
            }
            RaceStatus::Completed | RaceStatus::Cancelled => {}
        }
        Ok(outcome)
    }

    /// Apply a progress update from a roster member. Values are trusted for
    /// fan-out only; finish state flips at most once.
    pub fn apply_progress(
        &mut self,
        identity_id: &str,
        position: usize,
        wpm: f64,
        accuracy: f64,
        errors: u32,
        is_finished: bool,
        now_ms: i64,
    ) -> Result<ProgressOutcome> {
        match self.status {
            RaceStatus::Active => {}
            RaceStatus::Completed | RaceStatus::Cancelled => return Err(RaceError::Finished),
            RaceStatus::Waiting | RaceStatus::Countdown => {
                return Err(RaceError::InvalidParams("race is not active".into()))
            }
        }
        let char_count = self.text.char_count();
        let started_at = self.started_at_ms.unwrap_or(now_ms);
        let already_finished = self.finished_count();

        let player = self
            .roster
            .get_mut(identity_id)
            .ok_or(RaceError::NotInRace)?;
        if player.finished {
            return Ok(ProgressOutcome::default());
        }

        player.position = position.min(char_count);
        player.wpm = wpm.max(0.0).round() as u32;
        player.accuracy = (accuracy.max(0.0).round() as u32).min(100);
        player.errors = errors;

        let mut outcome = ProgressOutcome {
            changed: true,
            ..Default::default()
        };
        if is_finished {
            let finish_time = now_ms.saturating_sub(started_at).max(0) as u64;
            let rank = already_finished + 1;
            player.finished = true;
            player.finish_time_ms = Some(finish_time);
            player.rank = Some(rank);
            outcome.newly_finished = Some((rank, finish_time));
            outcome.first_finisher = already_finished == 0;
            outcome.all_finished = self.roster.values().all(|p| p.finished);
        }
        Ok(outcome)
    }

    /// Grace window length after the first words-mode finisher.
    pub fn grace_window_ms(&self, cap_ms: u64, now_ms: i64) -> u64 {
        match self.params.mode {
            SessionMode::Words => cap_ms,
            SessionMode::Time => {
                let deadline = self.started_at_ms.unwrap_or(now_ms)
                    + self.params.limit as i64 * 1_000;
                cap_ms.min(deadline.saturating_sub(now_ms).max(0) as u64)
            }
        }
    }

    /// Finalize: assign the definitive ranking, recompute persisted
    /// per-player stats, and build the sink records.
    ///
    /// Finished players order by (finish time, wpm desc, errors asc,
    /// identity id asc); unfinished players follow, by (wpm desc, errors
    /// asc, identity id asc).
    pub fn complete(&mut self, wpm_ceiling: u32, now_ms: i64) -> Result<CompletionSummary> {
        match self.status {
            RaceStatus::Active => {}
            RaceStatus::Completed | RaceStatus::Cancelled => return Err(RaceError::Finished),
            RaceStatus::Waiting | RaceStatus::Countdown => {
                return Err(RaceError::InvalidParams("race is not active".into()))
            }
        }
        self.transition(RaceStatus::Completed);
        self.ended_at_ms = Some(now_ms);
        self.evict_at_ms = Some(now_ms + self.eviction_delay_ms as i64);

        let started_at = self.started_at_ms.unwrap_or(now_ms);
        let duration_ms = now_ms.saturating_sub(started_at).max(0) as u64;

        let mut order: Vec<&PlayerProgress> = self.roster.values().collect();
        order.sort_by(|a, b| {
            match (a.finished, b.finished) {
                (true, false) => std::cmp::Ordering::Less,
                (false, true) => std::cmp::Ordering::Greater,
                (true, true) => a
                    .finish_time_ms
                    .cmp(&b.finish_time_ms)
                    .then(b.wpm.cmp(&a.wpm))
                    .then(a.errors.cmp(&b.errors))
                    .then(a.identity.id.cmp(&b.identity.id)),
                (false, false) => b
                    .wpm
                    .cmp(&a.wpm)
                    .then(a.errors.cmp(&b.errors))
                    .then(a.identity.id.cmp(&b.identity.id)),
            }
        });
        let ranked_ids: Vec<String> = order.iter().map(|p| p.identity.id.clone()).collect();

        let mut rankings = Vec::with_capacity(ranked_ids.len());
        let mut results = Vec::with_capacity(ranked_ids.len());
        for (index, id) in ranked_ids.iter().enumerate() {
            let rank = index as u32 + 1;
            let player = self.roster.get_mut(id).expect("ranked from roster");
            player.rank = Some(rank);

            let window_ms = player.finish_time_ms.unwrap_or(duration_ms);
            let wpm = plausible_wpm(player.wpm, player.position, window_ms, wpm_ceiling);
            results.push(RaceResult {
                race_id: self.id,
                identity_id: player.identity.id.clone(),
                username: player.identity.username.clone(),
                mode: self.params.mode,
                limit: self.params.limit,
                rank,
                wpm,
                accuracy: player.accuracy.min(100),
                errors: player.errors,
                finished: player.finished,
                finish_time_ms: player.finish_time_ms,
                completed_at: Utc::now(),
            });
            rankings.push(player.snapshot());
        }

        let average_wpm = if results.is_empty() {
            0
        } else {
            (results.iter().map(|r| r.wpm as u64).sum::<u64>() / results.len() as u64) as u32
        };

        Ok(CompletionSummary {
            winner_id: rankings.first().map(|p| p.identity_id.clone()),
            rankings,
            results,
            average_wpm,
            duration_ms,
        })
    }

    /// Terminal cancellation from any non-terminal state.
    pub fn cancel(&mut self, now_ms: i64) {
        if self.status.is_terminal() {
            return;
        }
        self.transition(RaceStatus::Cancelled);
        self.ended_at_ms = Some(now_ms);
        self.evict_at_ms = Some(now_ms + self.eviction_delay_ms as i64);
        self.timer_generation += 1;
    }

    /// A race that never completed within its TTL is cancelled by the
    /// sweep.
    pub fn ttl_due(&self, now_ms: i64) -> bool {
        !self.status.is_terminal() && now_ms - self.created_at_ms >= self.waiting_ttl_ms as i64
    }

    pub fn is_evictable(&self, now_ms: i64) -> bool {
        matches!(self.evict_at_ms, Some(at) if now_ms >= at)
    }
}

/// Cross-check a client-reported wpm against the throughput the server
/// actually observed (position over the active window), then cap to the
/// plausibility ceiling.
fn plausible_wpm(claimed: u32, position: usize, window_ms: u64, ceiling: u32) -> u32 {
    let implied = metrics::wpm(position as u32, window_ms);
    // Allow 25% headroom over the implied rate for fan-out lag before the
    // claim is discounted.
    let allowed = implied + implied / 4;
    claimed.min(allowed).min(ceiling)
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 10_000_000;

    fn make_params(mode: SessionMode, limit: u32) -> RaceParams {
        match mode {
            SessionMode::Time => RaceParams::validate(
                "test race".into(),
                mode,
                Some(limit),
                None,
                4,
                false,
            )
            .unwrap(),
            SessionMode::Words => RaceParams::validate(
                "test race".into(),
                mode,
                None,
                Some(limit),
                4,
                false,
            )
            .unwrap(),
        }
    }

    fn make_race(mode: SessionMode, limit: u32) -> Race {
        Race::new(
            "ABC123".into(),
            make_params(mode, limit),
            ReferenceText::from_tokens(vec!["one".into(), "two".into(), "three".into()]),
            "u1".into(),
            3_600_000,
            60_000,
            T0,
        )
    }

    fn player(n: u32) -> Identity {
        Identity::new(format!("u{}", n), format!("player{}", n))
    }

    /// Waiting race with two players, countdown begun and activated.
    fn active_race() -> Race {
        let mut race = make_race(SessionMode::Words, 10);
        race.add_player(player(1), T0).unwrap();
        race.add_player(player(2), T0 + 100).unwrap();
        race.begin_countdown(T0 + 100);
        race.activate(T0 + 5_100);
        race
    }

    #[test]
    fn test_params_validation() {
        assert!(RaceParams::validate("x".repeat(51), SessionMode::Time, Some(60), None, 4, false)
            .is_err());
        assert!(RaceParams::validate("ok".into(), SessionMode::Time, Some(10), None, 4, false)
            .is_err());
        assert!(RaceParams::validate("ok".into(), SessionMode::Time, Some(301), None, 4, false)
            .is_err());
        assert!(RaceParams::validate("ok".into(), SessionMode::Words, None, Some(5), 4, false)
            .is_err());
        assert!(RaceParams::validate("ok".into(), SessionMode::Time, Some(60), None, 1, false)
            .is_err());
        assert!(RaceParams::validate("ok".into(), SessionMode::Time, Some(60), None, 21, false)
            .is_err());
        // Continuous race durations are fine off the individual-test menu.
        assert!(RaceParams::validate("ok".into(), SessionMode::Time, Some(45), None, 4, false)
            .is_ok());
    }

    #[test]
    fn test_second_join_starts_countdown() {
        let mut race = make_race(SessionMode::Words, 10);
        let first = race.add_player(player(1), T0).unwrap();
        assert_eq!(first, JoinOutcome::Joined { starts_countdown: false });

        let second = race.add_player(player(2), T0 + 50).unwrap();
        assert_eq!(second, JoinOutcome::Joined { starts_countdown: true });
    }

    #[test]
    fn test_duplicate_join_is_a_noop() {
        let mut race = make_race(SessionMode::Words, 10);
        race.add_player(player(1), T0).unwrap();
        let roster_before = race.roster.len();

        let outcome = race.add_player(player(1), T0 + 50).unwrap();
        assert_eq!(outcome, JoinOutcome::AlreadyPresent);
        assert_eq!(race.roster.len(), roster_before);
    }

    #[test]
    fn test_exactly_max_players_fit() {
        let mut race = make_race(SessionMode::Words, 10);
        for n in 1..=4 {
            race.add_player(player(n), T0).unwrap();
        }
        assert_eq!(race.roster.len(), 4);
        // Capacity 4: the fifth join is refused outright.
        assert!(matches!(
            race.add_player(player(5), T0),
            Err(RaceError::Full)
        ));
    }

    #[test]
    fn test_join_rejected_during_countdown_and_active() {
        let mut race = make_race(SessionMode::Words, 10);
        race.add_player(player(1), T0).unwrap();
        race.add_player(player(2), T0).unwrap();
        race.begin_countdown(T0);
        assert!(matches!(
            race.add_player(player(3), T0 + 1_000),
            Err(RaceError::AlreadyStarted)
        ));

        race.activate(T0 + 5_000);
        assert!(matches!(
            race.add_player(player(3), T0 + 6_000),
            Err(RaceError::AlreadyStarted)
        ));
    }

    #[test]
    fn test_lifecycle_never_skips_countdown() {
        let race = active_race();
        assert_eq!(race.status, RaceStatus::Active);
        assert!(race.countdown_started_at_ms.is_some());
        assert!(race.started_at_ms.is_some());
    }

    #[test]
    fn test_leave_during_countdown_downgrades_to_waiting() {
        let mut race = make_race(SessionMode::Words, 10);
        race.add_player(player(1), T0).unwrap();
        race.add_player(player(2), T0).unwrap();
        race.begin_countdown(T0);
        let generation = race.timer_generation;

        let outcome = race.remove_player("u2", T0 + 2_000).unwrap();
        assert!(outcome.removed);
        assert!(outcome.countdown_cancelled);
        assert_eq!(race.status, RaceStatus::Waiting);
        assert!(race.timer_generation > generation);
    }

    #[test]
    fn test_empty_roster_cancels() {
        let mut race = make_race(SessionMode::Words, 10);
        race.add_player(player(1), T0).unwrap();
        let outcome = race.remove_player("u1", T0 + 500).unwrap();
        assert!(outcome.race_cancelled);
        assert_eq!(race.status, RaceStatus::Cancelled);
        assert!(race.is_evictable(T0 + 500 + 60_000));
    }

    #[test]
    fn test_leave_while_active_freezes() {
        let mut race = active_race();
        race.apply_progress("u1", 5, 60.0, 98.0, 1, false, T0 + 6_000)
            .unwrap();
        let outcome = race.remove_player("u1", T0 + 7_000).unwrap();
        assert!(outcome.frozen);
        assert!(!outcome.removed);

        let p1 = &race.roster["u1"];
        assert!(!p1.connected);
        assert_eq!(p1.position, 5, "progress frozen, not cleared");
        assert_eq!(race.roster.len(), 2);
    }

    #[test]
    fn test_progress_rejected_unless_active() {
        let mut race = make_race(SessionMode::Words, 10);
        race.add_player(player(1), T0).unwrap();
        assert!(race
            .apply_progress("u1", 3, 40.0, 95.0, 0, false, T0 + 100)
            .is_err());
    }

    #[test]
    fn test_progress_from_stranger_rejected() {
        let mut race = active_race();
        assert!(matches!(
            race.apply_progress("u9", 3, 40.0, 95.0, 0, false, T0 + 6_000),
            Err(RaceError::NotInRace)
        ));
    }

    #[test]
    fn test_finish_assigns_rank_and_time_once() {
        let mut race = active_race();
        let outcome = race
            .apply_progress("u1", 13, 80.0, 100.0, 0, true, T0 + 5_100 + 12_340)
            .unwrap();
        assert_eq!(outcome.newly_finished, Some((1, 12_340)));
        assert!(outcome.first_finisher);
        assert!(!outcome.all_finished);

        // Further updates for a finished player are ignored.
        let again = race
            .apply_progress("u1", 13, 999.0, 100.0, 0, true, T0 + 30_000)
            .unwrap();
        assert!(!again.changed);
        assert_eq!(race.roster["u1"].finish_time_ms, Some(12_340));
    }

    #[test]
    fn test_all_finished() {
        let mut race = active_race();
        race.apply_progress("u1", 13, 80.0, 100.0, 0, true, T0 + 15_000)
            .unwrap();
        let outcome = race
            .apply_progress("u2", 13, 70.0, 97.0, 1, true, T0 + 18_000)
            .unwrap();
        assert!(outcome.all_finished);
        assert!(!outcome.first_finisher);
    }

    #[test]
    fn test_completion_ranks_are_a_permutation() {
        let mut race = make_race(SessionMode::Words, 10);
        for n in 1..=4 {
            race.add_player(player(n), T0).unwrap();
        }
        race.begin_countdown(T0);
        race.activate(T0 + 5_000);

        race.apply_progress("u3", 13, 90.0, 100.0, 0, true, T0 + 15_000)
            .unwrap();
        race.apply_progress("u1", 10, 70.0, 95.0, 2, false, T0 + 15_000)
            .unwrap();
        race.apply_progress("u2", 8, 55.0, 92.0, 3, false, T0 + 15_000)
            .unwrap();
        // u4 never reports.

        let summary = race.complete(300, T0 + 20_000).unwrap();
        let mut ranks: Vec<u32> = summary.rankings.iter().filter_map(|p| p.rank).collect();
        ranks.sort_unstable();
        assert_eq!(ranks, vec![1, 2, 3, 4]);

        // Finished player first, then unfinished by wpm.
        assert_eq!(summary.rankings[0].identity_id, "u3");
        assert_eq!(summary.rankings[1].identity_id, "u1");
        assert_eq!(summary.rankings[2].identity_id, "u2");
        assert_eq!(summary.rankings[3].identity_id, "u4");
        assert_eq!(summary.winner_id.as_deref(), Some("u3"));
    }

    #[test]
    fn test_tied_finish_breaks_on_identity_id() {
        let mut race = active_race();
        // Both finish at the same instant with identical stats.
        race.apply_progress("u2", 13, 64.0, 100.0, 0, true, T0 + 5_100 + 12_340)
            .unwrap();
        race.apply_progress("u1", 13, 64.0, 100.0, 0, true, T0 + 5_100 + 12_340)
            .unwrap();

        let summary = race.complete(300, T0 + 5_100 + 13_000).unwrap();
        // Same finish time, wpm, errors: identity id ascending decides.
        assert_eq!(summary.rankings[0].identity_id, "u1");
        assert_eq!(summary.rankings[0].rank, Some(1));
        assert_eq!(summary.rankings[1].identity_id, "u2");
        assert_eq!(summary.rankings[1].rank, Some(2));
    }

    #[test]
    fn test_persisted_wpm_is_capped_and_cross_checked() {
        let mut race = active_race();
        // 13 chars in ~12 s is ~13 wpm implied; a 250 wpm claim is absurd.
        race.apply_progress("u1", 13, 250.0, 100.0, 0, true, T0 + 5_100 + 12_000)
            .unwrap();
        race.apply_progress("u2", 13, 40.0, 100.0, 0, true, T0 + 5_100 + 13_000)
            .unwrap();

        let summary = race.complete(300, T0 + 5_100 + 14_000).unwrap();
        let u1 = summary.results.iter().find(|r| r.identity_id == "u1").unwrap();
        // Implied: round((13/5)/(12000/60000)) = 13, plus 25% headroom.
        assert!(u1.wpm <= 16, "claim must be discounted, got {}", u1.wpm);
        assert!(summary.results.iter().all(|r| r.wpm <= 300));
        assert!(summary.results.iter().all(|r| r.accuracy <= 100));
    }

    #[test]
    fn test_complete_twice_is_an_error() {
        let mut race = active_race();
        race.complete(300, T0 + 20_000).unwrap();
        assert!(matches!(
            race.complete(300, T0 + 21_000),
            Err(RaceError::Finished)
        ));
    }

    #[test]
    fn test_ttl_cancellation() {
        let race = make_race(SessionMode::Words, 10);
        assert!(!race.ttl_due(T0 + 3_599_999));
        assert!(race.ttl_due(T0 + 3_600_000));
    }

    #[test]
    fn test_grace_window_words_mode_uses_cap() {
        let race = active_race();
        assert_eq!(race.grace_window_ms(30_000, T0 + 25_100), 30_000);
    }

    #[test]
    fn test_grace_window_time_mode_uses_remaining() {
        let mut race = make_race(SessionMode::Time, 60);
        race.add_player(player(1), T0).unwrap();
        race.add_player(player(2), T0).unwrap();
        race.begin_countdown(T0);
        race.activate(T0 + 5_000);
        // 50 s into a 60 s race: 10 s remain, below the 30 s cap.
        assert_eq!(race.grace_window_ms(30_000, T0 + 55_000), 10_000);
    }
}
