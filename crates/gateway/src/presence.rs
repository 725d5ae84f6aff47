//! Presence fan-out to friends.
//!
//! Presence changes land on each online friend's `user:<id>` room. An
//! invisible user emits nothing on connect and looks offline to friends.
//! Friend sets come from the friend-graph collaborator; there is no
//! cross-entity ordering guarantee between presence events and anything
//! else.

use crate::client::{Connection, ConnectionRegistry};
use crate::rooms::RoomFabric;
use common::{
    user_room, Fanout, FriendPresencePayload, PresenceStatus, ServerMessage,
};
use external_services::FriendGraph;
use std::sync::Arc;
use tracing::debug;

pub struct PresenceTracker {
    friends: Arc<dyn FriendGraph>,
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomFabric>,
}

impl PresenceTracker {
    pub fn new(
        friends: Arc<dyn FriendGraph>,
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomFabric>,
    ) -> Self {
        Self {
            friends,
            registry,
            rooms,
        }
    }

    /// First connection of an identity came up.
    pub async fn announce_online(&self, connection: &Arc<Connection>) {
        if !connection.presence().visible() {
            return;
        }
        let activity = connection.activity.lock().expect("activity lock").clone();
        self.broadcast_to_friends(
            &connection.identity.id,
            ServerMessage::FriendOnline(FriendPresencePayload {
                identity_id: connection.identity.id.clone(),
                username: connection.identity.username.clone(),
                status: Some(connection.presence()),
                activity,
            }),
        )
        .await;
    }

    /// Last connection of an identity went away.
    pub async fn announce_offline(&self, connection: &Arc<Connection>) {
        if !connection.presence().visible() {
            return;
        }
        self.broadcast_to_friends(
            &connection.identity.id,
            ServerMessage::FriendPresenceOffline(FriendPresencePayload {
                identity_id: connection.identity.id.clone(),
                username: connection.identity.username.clone(),
                status: None,
                activity: None,
            }),
        )
        .await;
    }

    /// Self-reported status change. Going invisible looks like going
    /// offline to friends; leaving invisibility looks like coming online.
    pub async fn update_status(
        &self,
        connection: &Arc<Connection>,
        status: PresenceStatus,
        activity: Option<String>,
    ) {
        let previous = {
            let mut presence = connection.presence.lock().expect("presence lock");
            let previous = *presence;
            *presence = status;
            previous
        };
        *connection.activity.lock().expect("activity lock") = activity.clone();

        debug!(user = %connection.identity.username, ?status, "presence updated");
        match (previous.visible(), status.visible()) {
            (true, false) => self.announce_offline_as(connection).await,
            (false, true) | (true, true) => {
                self.broadcast_to_friends(
                    &connection.identity.id,
                    ServerMessage::FriendOnline(FriendPresencePayload {
                        identity_id: connection.identity.id.clone(),
                        username: connection.identity.username.clone(),
                        status: Some(status),
                        activity,
                    }),
                )
                .await;
            }
            (false, false) => {}
        }
    }

    /// Offline announcement regardless of current visibility; used when a
    /// user goes invisible.
    async fn announce_offline_as(&self, connection: &Arc<Connection>) {
        self.broadcast_to_friends(
            &connection.identity.id,
            ServerMessage::FriendPresenceOffline(FriendPresencePayload {
                identity_id: connection.identity.id.clone(),
                username: connection.identity.username.clone(),
                status: None,
                activity: None,
            }),
        )
        .await;
    }

    async fn broadcast_to_friends(&self, identity_id: &str, message: ServerMessage) {
        for friend_id in self.friends.friends_of(identity_id).await {
            if self.registry.is_online(&friend_id) {
                self.rooms.publish(&user_room(&friend_id), message.clone());
            }
        }
    }
}
