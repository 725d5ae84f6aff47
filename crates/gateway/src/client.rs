//! Connection state and registry.
//!
//! The registry is the process-wide table from connection id to
//! authenticated session context, with a secondary index from identity id
//! to that identity's connections (multi-connection per user).

use crate::outbound::{PushOutcome, SendQueue};
use chrono::Utc;
use common::{Identity, OutboundFrame, PresenceStatus, ServerMessage};
use dashmap::{DashMap, DashSet};
use metrics::gauge;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

/// One authenticated WebSocket connection.
pub struct Connection {
    pub id: Uuid,
    pub identity: Identity,
    pub connected_at_ms: i64,
    pub last_activity_ms: AtomicI64,
    pub remote_addr: Option<SocketAddr>,
    pub queue: Arc<SendQueue>,
    /// Rooms this connection is subscribed to.
    pub rooms: DashSet<String>,
    /// A connection races in at most one race at a time.
    pub current_race: Mutex<Option<Uuid>>,
    pub presence: Mutex<PresenceStatus>,
    pub activity: Mutex<Option<String>>,
}

impl Connection {
    pub fn new(
        identity: Identity,
        remote_addr: Option<SocketAddr>,
        queue: Arc<SendQueue>,
    ) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4(),
            identity,
            connected_at_ms: now,
            last_activity_ms: AtomicI64::new(now),
            remote_addr,
            queue,
            rooms: DashSet::new(),
            current_race: Mutex::new(None),
            presence: Mutex::new(PresenceStatus::Online),
            activity: Mutex::new(None),
        }
    }

    /// Serialize and enqueue one frame directly to this connection.
    pub fn send(&self, message: ServerMessage) -> PushOutcome {
        let critical = message.is_critical();
        let frame = OutboundFrame::new(message);
        match serde_json::to_string(&frame) {
            Ok(json) => self
                .queue
                .push(json, critical, Utc::now().timestamp_millis()),
            Err(err) => {
                debug!(connection = %self.id, %err, "failed to serialize outbound frame");
                PushOutcome::Closing
            }
        }
    }

    pub fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn idle_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.last_activity_ms.load(Ordering::Relaxed)
    }

    pub fn presence(&self) -> PresenceStatus {
        *self.presence.lock().expect("presence lock")
    }
}

/// Process-wide connection table with an identity index.
pub struct ConnectionRegistry {
    connections: DashMap<Uuid, Arc<Connection>>,
    by_identity: DashMap<String, DashSet<Uuid>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            by_identity: DashMap::new(),
        }
    }

    pub fn register(&self, connection: Arc<Connection>) -> Uuid {
        let id = connection.id;
        self.by_identity
            .entry(connection.identity.id.clone())
            .or_default()
            .insert(id);
        self.connections.insert(id, connection.clone());
        gauge!("gateway_active_connections").set(self.connections.len() as f64);
        info!(connection = %id, user = %connection.identity.username, "connection registered");
        id
    }

    /// Remove a connection; returns true when it was the identity's last.
    pub fn unregister(&self, connection_id: &Uuid) -> bool {
        let Some((_, connection)) = self.connections.remove(connection_id) else {
            return false;
        };
        let mut last = false;
        if let Some(set) = self.by_identity.get(&connection.identity.id) {
            set.remove(connection_id);
            last = set.is_empty();
        }
        if last {
            self.by_identity.remove(&connection.identity.id);
        }
        gauge!("gateway_active_connections").set(self.connections.len() as f64);
        info!(connection = %connection_id, "connection unregistered");
        last
    }

    pub fn get(&self, connection_id: &Uuid) -> Option<Arc<Connection>> {
        self.connections.get(connection_id).map(|c| c.clone())
    }

    /// All live connections of an identity; a snapshot, safe to iterate.
    pub fn sockets_of(&self, identity_id: &str) -> Vec<Arc<Connection>> {
        self.by_identity
            .get(identity_id)
            .map(|set| {
                set.iter()
                    .filter_map(|id| self.connections.get(&*id).map(|c| c.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_online(&self, identity_id: &str) -> bool {
        self.by_identity
            .get(identity_id)
            .map(|set| !set.is_empty())
            .unwrap_or(false)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Snapshot of all connections for housekeeping scans.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_connection(user: &str) -> Arc<Connection> {
        Arc::new(Connection::new(
            Identity::new(user, user),
            None,
            Arc::new(SendQueue::new(256, 1 << 20)),
        ))
    }

    #[test]
    fn test_register_and_identity_index() {
        let registry = ConnectionRegistry::new();
        let a1 = make_connection("alice");
        let a2 = make_connection("alice");
        let b = make_connection("bob");

        registry.register(a1.clone());
        registry.register(a2.clone());
        registry.register(b.clone());

        assert_eq!(registry.connection_count(), 3);
        assert_eq!(registry.sockets_of("alice").len(), 2);
        assert!(registry.is_online("bob"));
        assert!(!registry.is_online("carol"));
    }

    #[test]
    fn test_unregister_reports_last_connection() {
        let registry = ConnectionRegistry::new();
        let a1 = make_connection("alice");
        let a2 = make_connection("alice");
        registry.register(a1.clone());
        registry.register(a2.clone());

        assert!(!registry.unregister(&a1.id));
        assert!(registry.is_online("alice"));
        assert!(registry.unregister(&a2.id));
        assert!(!registry.is_online("alice"));
    }

    #[test]
    fn test_send_enqueues_frame() {
        let connection = make_connection("alice");
        assert_eq!(connection.send(ServerMessage::Pong), PushOutcome::Queued);
        let frames = connection.queue.pop_all();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].json.contains("\"type\":\"pong\""));
    }
}
