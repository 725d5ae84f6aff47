//! Room fabric: topic-based fan-out with per-room FIFO ordering.
//!
//! A room is a named set of subscribed connections. `publish` serializes the
//! frame once and enqueues it to every subscriber while holding that room's
//! lock, so two publishes to the same room are observed in publisher order
//! by every subscriber. No ordering is guaranteed across rooms, nothing is
//! persisted, and late subscribers see only what is published after they
//! subscribe.

use crate::client::Connection;
use crate::outbound::PushOutcome;
use chrono::Utc;
use common::{Fanout, OutboundFrame, ServerMessage};
use dashmap::DashMap;
use metrics::{counter, gauge};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

struct Room {
    subscribers: HashMap<Uuid, Arc<Connection>>,
    /// Monotonic per-room publish sequence.
    seq: u64,
    /// Set when the last subscriber leaves; reclaimed after a grace period.
    empty_since_ms: Option<i64>,
}

impl Room {
    fn new() -> Self {
        Self {
            subscribers: HashMap::new(),
            seq: 0,
            empty_since_ms: None,
        }
    }
}

/// Named rooms, created lazily on first subscribe.
pub struct RoomFabric {
    rooms: DashMap<String, Mutex<Room>>,
}

impl RoomFabric {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
        }
    }

    pub fn subscribe(&self, room_name: &str, connection: Arc<Connection>) {
        connection.rooms.insert(room_name.to_string());
        let entry = self
            .rooms
            .entry(room_name.to_string())
            .or_insert_with(|| Mutex::new(Room::new()));
        let mut room = entry.lock().expect("room lock");
        room.subscribers.insert(connection.id, connection.clone());
        room.empty_since_ms = None;
        debug!(room = room_name, connection = %connection.id, subs = room.subscribers.len(), "subscribed");
    }

    pub fn unsubscribe(&self, room_name: &str, connection: &Arc<Connection>) {
        connection.rooms.remove(room_name);
        if let Some(entry) = self.rooms.get(room_name) {
            let mut room = entry.lock().expect("room lock");
            room.subscribers.remove(&connection.id);
            if room.subscribers.is_empty() {
                room.empty_since_ms = Some(Utc::now().timestamp_millis());
            }
        }
    }

    /// Drop a departing connection from every room it joined.
    pub fn unsubscribe_all(&self, connection: &Arc<Connection>) {
        let names: Vec<String> = connection.rooms.iter().map(|r| r.clone()).collect();
        for name in names {
            self.unsubscribe(&name, connection);
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn subscriber_count(&self, room_name: &str) -> usize {
        self.rooms
            .get(room_name)
            .map(|entry| entry.lock().expect("room lock").subscribers.len())
            .unwrap_or(0)
    }

    /// Reclaim rooms that have been empty past the grace period.
    pub fn reclaim_empty(&self, grace_ms: u64) {
        let now_ms = Utc::now().timestamp_millis();
        let mut stale = Vec::new();
        for entry in self.rooms.iter() {
            let room = entry.value().lock().expect("room lock");
            if let Some(since) = room.empty_since_ms {
                if room.subscribers.is_empty() && now_ms - since >= grace_ms as i64 {
                    stale.push(entry.key().clone());
                }
            }
        }
        for name in stale {
            // Re-check under the entry to avoid racing a fresh subscribe.
            self.rooms.remove_if(&name, |_, room| {
                room.lock().expect("room lock").subscribers.is_empty()
            });
        }
        gauge!("gateway_active_rooms").set(self.rooms.len() as f64);
    }

    fn publish_inner(&self, room_name: &str, message: ServerMessage, critical: bool) {
        let Some(entry) = self.rooms.get(room_name) else {
            return;
        };

        let frame = OutboundFrame::new(message);
        let json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(err) => {
                warn!(room = room_name, %err, "failed to serialize broadcast frame");
                return;
            }
        };

        let now_ms = Utc::now().timestamp_millis();
        let mut room = entry.lock().expect("room lock");
        room.seq += 1;
        let mut closing = Vec::new();
        for connection in room.subscribers.values() {
            match connection.queue.push(json.clone(), critical, now_ms) {
                PushOutcome::Queued => {}
                PushOutcome::DroppedOldest => {
                    counter!("gateway_frames_dropped_total").increment(1);
                    debug!(room = room_name, connection = %connection.id, "dropped frame for slow subscriber");
                }
                PushOutcome::Closing => {
                    counter!("gateway_slow_consumer_closes_total").increment(1);
                    closing.push(connection.id);
                }
            }
        }
        for id in closing {
            room.subscribers.remove(&id);
        }
        counter!("gateway_frames_published_total").increment(1);
    }
}

impl Fanout for RoomFabric {
    fn publish(&self, room: &str, message: ServerMessage) {
        let critical = message.is_critical();
        self.publish_inner(room, message, critical);
    }

    fn publish_critical(&self, room: &str, message: ServerMessage) {
        self.publish_inner(room, message, true);
    }
}

impl Default for RoomFabric {
    fn default() -> Self {
        Self::new()
    }
}
