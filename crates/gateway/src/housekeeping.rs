//! Periodic housekeeping.
//!
//! One sweep task: expires tests, cancels stuck races, reclaims empty
//! rooms, purges idle rate buckets, and logs (but does not close) idle
//! connections, which may be spectating.

use crate::router::SessionRouter;
use chrono::Utc;
use metrics::gauge;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::info;

/// Sweep cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Connections idle past this are flagged in the log.
const IDLE_FLAG_MS: i64 = 300_000;

pub fn spawn(router: Arc<SessionRouter>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let now_ms = Utc::now().timestamp_millis();

            router.tests.sweep();
            router.races.sweep();
            router.rooms.reclaim_empty(router.config.empty_room_grace_ms);
            router.governor.sweep(now_ms);

            let connections = router.registry.snapshot();
            let idle = connections
                .iter()
                .filter(|c| c.idle_ms(now_ms) > IDLE_FLAG_MS)
                .count();

            gauge!("gateway_idle_connections").set(idle as f64);
            info!(
                connections = connections.len(),
                idle,
                rooms = router.rooms.room_count(),
                tests = router.tests.session_count(),
                races = router.races.race_count(),
                rate_buckets = router.governor.bucket_count(),
                "housekeeping sweep"
            );
        }
    })
}
