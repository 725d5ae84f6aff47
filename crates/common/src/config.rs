//! Engine configuration.
//!
//! Read once from the environment by the binary and passed down as a typed
//! handle. Defaults match production; every knob can be overridden with an
//! environment variable of the same (upper snake case) name.

use std::env;
use std::time::Duration;

/// Bounds for the race countdown duration.
const COUNTDOWN_MIN_MS: u64 = 3_000;
const COUNTDOWN_MAX_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum simultaneous connections per authenticated identity.
    pub max_connections_per_identity: usize,
    /// Race countdown length, clamped to 3..=10 seconds.
    pub countdown_duration_ms: u64,
    /// TTL for a test session from creation.
    pub test_session_ttl_ms: u64,
    /// TTL for a race that never leaves `waiting`.
    pub race_waiting_ttl_ms: u64,
    /// Keystroke log cap per session; the log is halved when it fills.
    pub keystroke_log_cap: usize,
    /// Minimum interval between `test:stats_update` emits per session.
    pub stats_broadcast_min_interval_ms: u64,
    /// Physically plausible ceiling for persisted wpm.
    pub max_wpm_plausibility_ceiling: u32,
    /// Per-connection outbound queue cap (messages).
    pub send_queue_max_messages: usize,
    /// Per-connection outbound queue cap (bytes).
    pub send_queue_max_bytes: usize,
    /// Whether non-players may subscribe to race rooms.
    pub allow_spectators: bool,
    /// Linger before evicting a completed test session.
    pub test_eviction_delay_ms: u64,
    /// Linger before evicting a terminal race.
    pub race_eviction_delay_ms: u64,
    /// Grace before reclaiming an empty room.
    pub empty_room_grace_ms: u64,
    /// Words-mode grace window cap after the first finisher.
    pub finish_grace_cap_ms: u64,
    /// Deadline for word-source fetches.
    pub word_source_timeout: Duration,
    /// Deadline for result-sink calls.
    pub result_sink_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_connections_per_identity: 5,
            countdown_duration_ms: 5_000,
            test_session_ttl_ms: 600_000,
            race_waiting_ttl_ms: 3_600_000,
            keystroke_log_cap: 10_000,
            stats_broadcast_min_interval_ms: 100,
            max_wpm_plausibility_ceiling: 300,
            send_queue_max_messages: 256,
            send_queue_max_bytes: 1_048_576,
            allow_spectators: true,
            test_eviction_delay_ms: 30_000,
            race_eviction_delay_ms: 60_000,
            empty_room_grace_ms: 60_000,
            finish_grace_cap_ms: 30_000,
            word_source_timeout: Duration::from_secs(3),
            result_sink_timeout: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    /// Build from environment variables, falling back to defaults for
    /// anything absent or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut cfg = Self {
            max_connections_per_identity: env_parse(
                "MAX_CONNECTIONS_PER_IDENTITY",
                defaults.max_connections_per_identity,
            ),
            countdown_duration_ms: env_parse(
                "COUNTDOWN_DURATION_MS",
                defaults.countdown_duration_ms,
            ),
            test_session_ttl_ms: env_parse("TEST_SESSION_TTL_MS", defaults.test_session_ttl_ms),
            race_waiting_ttl_ms: env_parse("RACE_WAITING_TTL_MS", defaults.race_waiting_ttl_ms),
            keystroke_log_cap: env_parse("KEYSTROKE_LOG_CAP", defaults.keystroke_log_cap),
            stats_broadcast_min_interval_ms: env_parse(
                "STATS_BROADCAST_MIN_INTERVAL_MS",
                defaults.stats_broadcast_min_interval_ms,
            ),
            max_wpm_plausibility_ceiling: env_parse(
                "MAX_WPM_PLAUSIBILITY_CEILING",
                defaults.max_wpm_plausibility_ceiling,
            ),
            send_queue_max_messages: env_parse(
                "SEND_QUEUE_MAX_MESSAGES",
                defaults.send_queue_max_messages,
            ),
            send_queue_max_bytes: env_parse(
                "SEND_QUEUE_MAX_BYTES",
                defaults.send_queue_max_bytes,
            ),
            allow_spectators: env_parse("ALLOW_SPECTATORS", defaults.allow_spectators),
            ..defaults
        };
        cfg.countdown_duration_ms = cfg
            .countdown_duration_ms
            .clamp(COUNTDOWN_MIN_MS, COUNTDOWN_MAX_MS);
        cfg
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
