//! Per-identity, per-class token buckets.
//!
//! Keystrokes dwarf every other event class, bursty race progress must not
//! starve chat, and a chatty user must not lose keystroke capacity, so each
//! class refills its own bucket. Buckets live behind per-bucket mutexes in
//! a dashmap and are evicted after ten idle minutes.

use dashmap::DashMap;
use metrics::counter;
use std::sync::Mutex;
use tracing::debug;

/// Idle buckets are purged after this long.
const BUCKET_IDLE_EVICT_MS: i64 = 600_000;

/// Event class for quota purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateClass {
    /// Inbound handshakes, keyed by remote address.
    Connection,
    Keystroke,
    RaceProgress,
    Chat,
    General,
}

impl RateClass {
    /// Bucket capacity (burst size).
    pub fn capacity(self) -> f64 {
        match self {
            RateClass::Connection => 10.0,
            RateClass::Keystroke => 20.0,
            RateClass::RaceProgress => 10.0,
            RateClass::Chat => 5.0,
            RateClass::General => 100.0,
        }
    }

    /// Refill rate, tokens per second.
    pub fn refill_per_sec(self) -> f64 {
        match self {
            RateClass::Connection => 1.0 / 6.0,
            RateClass::Keystroke => 20.0,
            RateClass::RaceProgress => 10.0,
            RateClass::Chat => 1.0 / 12.0,
            RateClass::General => 1.0 / 6.0,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RateClass::Connection => "connection",
            RateClass::Keystroke => "keystroke",
            RateClass::RaceProgress => "race_progress",
            RateClass::Chat => "chat",
            RateClass::General => "general",
        }
    }
}

/// Outcome of a quota check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    /// Whole tokens left after this check.
    pub remaining: u32,
    /// When a denied caller may retry.
    pub retry_after_ms: u64,
}

#[derive(Debug)]
struct Bucket {
    allowance: f64,
    last_check_ms: i64,
    last_used_ms: i64,
}

/// Token-bucket governor keyed by (identity, class).
pub struct RateGovernor {
    buckets: DashMap<(String, RateClass), Mutex<Bucket>>,
}

impl RateGovernor {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Take one token from the (key, class) bucket.
    pub fn check(&self, key: &str, class: RateClass, now_ms: i64) -> Decision {
        let entry = self
            .buckets
            .entry((key.to_string(), class))
            .or_insert_with(|| {
                Mutex::new(Bucket {
                    allowance: class.capacity(),
                    last_check_ms: now_ms,
                    last_used_ms: now_ms,
                })
            });
        let mut bucket = entry.lock().expect("bucket lock");

        let elapsed_secs = (now_ms - bucket.last_check_ms).max(0) as f64 / 1_000.0;
        bucket.last_check_ms = now_ms;
        bucket.last_used_ms = now_ms;
        bucket.allowance =
            (bucket.allowance + elapsed_secs * class.refill_per_sec()).min(class.capacity());

        if bucket.allowance < 1.0 {
            let deficit = 1.0 - bucket.allowance;
            let retry_after_ms = (deficit / class.refill_per_sec() * 1_000.0).ceil() as u64;
            counter!("gateway_rate_limited_total", "class" => class.label()).increment(1);
            debug!(key, class = class.label(), retry_after_ms, "rate limited");
            return Decision {
                allowed: false,
                remaining: 0,
                retry_after_ms,
            };
        }

        bucket.allowance -= 1.0;
        Decision {
            allowed: true,
            remaining: bucket.allowance as u32,
            retry_after_ms: 0,
        }
    }

    /// Purge buckets idle past the eviction window.
    pub fn sweep(&self, now_ms: i64) {
        self.buckets.retain(|_, bucket| {
            let bucket = bucket.lock().expect("bucket lock");
            now_ms - bucket.last_used_ms < BUCKET_IDLE_EVICT_MS
        });
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

impl Default for RateGovernor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 5_000_000;

    #[test]
    fn test_keystroke_burst_capped_at_twenty() {
        let governor = RateGovernor::new();
        // 25 keystrokes inside one instant: exactly 20 pass.
        let allowed = (0..25)
            .filter(|_| governor.check("u1", RateClass::Keystroke, T0).allowed)
            .count();
        assert_eq!(allowed, 20);

        let denied = governor.check("u1", RateClass::Keystroke, T0);
        assert!(!denied.allowed);
        assert!(denied.retry_after_ms > 0);
    }

    #[test]
    fn test_keystroke_bucket_refills_at_rate() {
        let governor = RateGovernor::new();
        for _ in 0..20 {
            governor.check("u1", RateClass::Keystroke, T0);
        }
        assert!(!governor.check("u1", RateClass::Keystroke, T0).allowed);

        // 100 ms refills 2 tokens at 20/s.
        let later = governor.check("u1", RateClass::Keystroke, T0 + 100);
        assert!(later.allowed);
    }

    #[test]
    fn test_classes_do_not_share_buckets() {
        let governor = RateGovernor::new();
        for _ in 0..20 {
            governor.check("u1", RateClass::Keystroke, T0);
        }
        // Keystroke exhaustion leaves chat untouched.
        assert!(governor.check("u1", RateClass::Chat, T0).allowed);
    }

    #[test]
    fn test_identities_do_not_share_buckets() {
        let governor = RateGovernor::new();
        for _ in 0..20 {
            governor.check("u1", RateClass::Keystroke, T0);
        }
        assert!(governor.check("u2", RateClass::Keystroke, T0).allowed);
    }

    #[test]
    fn test_chat_is_slow_to_refill() {
        let governor = RateGovernor::new();
        for _ in 0..5 {
            assert!(governor.check("u1", RateClass::Chat, T0).allowed);
        }
        let denied = governor.check("u1", RateClass::Chat, T0);
        assert!(!denied.allowed);
        // 1 token per 12 s.
        assert!(denied.retry_after_ms > 11_000 && denied.retry_after_ms <= 12_000);
    }

    #[test]
    fn test_idle_buckets_evicted() {
        let governor = RateGovernor::new();
        governor.check("u1", RateClass::General, T0);
        governor.check("u2", RateClass::General, T0 + 500_000);
        assert_eq!(governor.bucket_count(), 2);

        governor.sweep(T0 + 700_000);
        assert_eq!(governor.bucket_count(), 1);
    }
}
