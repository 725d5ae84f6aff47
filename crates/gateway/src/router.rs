//! Session router: typed dispatch from inbound frames to the engines.
//!
//! Per frame: quota check on the event's rate class, schema validation,
//! then the engine call. Errors never mutate engine state; they surface as
//! error envelopes on the originating connection only.

use crate::client::{Connection, ConnectionRegistry};
use crate::error::{GatewayError, Result};
use crate::presence::PresenceTracker;
use crate::ratelimit::{RateClass, RateGovernor};
use crate::rooms::RoomFabric;
use chrono::Utc;
use common::{
    race_room, test_room, ClientMessage, EngineConfig, RaceRefPayload, ServerMessage,
};
use metrics::counter;
use race_engine::{RaceError, RaceStore};
use std::sync::Arc;
use test_engine::TestStore;
use tracing::{debug, warn};

pub struct SessionRouter {
    pub registry: Arc<ConnectionRegistry>,
    pub rooms: Arc<RoomFabric>,
    pub governor: Arc<RateGovernor>,
    pub tests: Arc<TestStore>,
    pub races: Arc<RaceStore>,
    pub presence: Arc<PresenceTracker>,
    pub config: EngineConfig,
}

impl SessionRouter {
    /// Handle one raw inbound frame from an authenticated connection.
    pub async fn dispatch(&self, connection: &Arc<Connection>, raw: &str) {
        connection.touch();
        if let Err(err) = self.handle_frame(connection, raw).await {
            debug!(connection = %connection.id, %err, "inbound frame rejected");
            self.send(connection, ServerMessage::Error(err.to_payload()));
        }
    }

    async fn handle_frame(&self, connection: &Arc<Connection>, raw: &str) -> Result<()> {
        let message: ClientMessage = serde_json::from_str(raw)?;

        let class = rate_class(&message);
        let decision =
            self.governor
                .check(&connection.identity.id, class, Utc::now().timestamp_millis());
        if !decision.allowed {
            return Err(GatewayError::RateLimited {
                retry_after_ms: decision.retry_after_ms,
            });
        }

        counter!("gateway_events_total", "class" => class.label()).increment(1);

        match message {
            ClientMessage::TestStart(payload) => {
                let joined = self
                    .tests
                    .start(
                        connection.identity.clone(),
                        connection.id,
                        payload.mode,
                        payload.duration,
                        payload.word_count,
                        payload.word_list_id,
                        payload.language,
                    )
                    .await?;
                self.rooms
                    .subscribe(&test_room(joined.test_id), connection.clone());
                self.send(connection, ServerMessage::TestJoined(joined));
            }
            ClientMessage::TestKeystroke(payload) => {
                self.tests.keystroke(
                    payload.test_id,
                    connection.id,
                    &payload.key,
                    payload.correct,
                )?;
            }
            ClientMessage::TestCompleted(payload) => {
                // The client's finalStats are advisory; the authoritative
                // result comes from the keystroke log.
                self.tests.complete(payload.test_id, connection.id)?;
            }
            ClientMessage::TestLeave(payload) => {
                self.tests.leave(payload.test_id, connection.id)?;
                self.rooms
                    .unsubscribe(&test_room(payload.test_id), connection);
            }
            ClientMessage::RaceCreate(payload) => {
                if self.in_a_race(connection) {
                    return Err(GatewayError::AlreadyRacing);
                }
                let state = self
                    .races
                    .create(
                        connection.identity.clone(),
                        payload.name,
                        payload.mode,
                        payload.duration,
                        payload.word_count,
                        payload.max_players,
                        payload.word_list_id,
                        payload.is_private,
                    )
                    .await?;
                let race_id = state.race.race_id;
                self.rooms
                    .subscribe(&race_room(race_id), connection.clone());
                *connection.current_race.lock().expect("race lock") = Some(race_id);
                self.send(connection, ServerMessage::RaceCreated(state));
            }
            ClientMessage::RaceJoin(payload) => {
                self.handle_race_join(connection, payload)?;
            }
            ClientMessage::RaceLeave(payload) => {
                self.races.leave(payload.race_id, &connection.identity)?;
                self.rooms
                    .unsubscribe(&race_room(payload.race_id), connection);
                let mut current = connection.current_race.lock().expect("race lock");
                if *current == Some(payload.race_id) {
                    *current = None;
                }
            }
            ClientMessage::RaceProgress(payload) => {
                self.races.progress(
                    payload.race_id,
                    &connection.identity.id,
                    payload.position,
                    payload.wpm,
                    payload.accuracy,
                    payload.errors,
                    payload.is_finished,
                )?;
            }
            ClientMessage::RaceFinish(payload) => {
                self.races.finish(
                    payload.race_id,
                    &connection.identity.id,
                    payload.final_stats.wpm,
                    payload.final_stats.accuracy,
                    payload.final_stats.errors,
                )?;
            }
            ClientMessage::RaceMessage(payload) => {
                self.races
                    .message(payload.race_id, &connection.identity, &payload.message)?;
            }
            ClientMessage::FriendsUpdateStatus(payload) => {
                self.presence
                    .update_status(connection, payload.status, payload.activity)
                    .await;
            }
            ClientMessage::Ping => {
                self.send(connection, ServerMessage::Pong);
            }
        }
        Ok(())
    }

    /// Join semantics: roster join while waiting; duplicate join (or a
    /// reconnecting player) resubscribes and gets the current state; a
    /// started race falls back to spectating when the policy allows it.
    fn handle_race_join(
        &self,
        connection: &Arc<Connection>,
        payload: RaceRefPayload,
    ) -> Result<()> {
        let race_id = payload.race_id;

        if self.races.is_member(race_id, &connection.identity.id) {
            // Duplicate join / reconnect: no roster change, fresh state.
            let state = self.races.state_of(race_id)?;
            self.rooms
                .subscribe(&race_room(race_id), connection.clone());
            *connection.current_race.lock().expect("race lock") = Some(race_id);
            self.send(connection, ServerMessage::RaceJoined(state));
            return Ok(());
        }

        if self.in_a_race(connection) {
            return Err(GatewayError::AlreadyRacing);
        }

        match self.races.join(race_id, connection.identity.clone()) {
            Ok(state) => {
                self.rooms
                    .subscribe(&race_room(race_id), connection.clone());
                *connection.current_race.lock().expect("race lock") = Some(race_id);
                self.send(connection, ServerMessage::RaceJoined(state));
                Ok(())
            }
            Err(RaceError::AlreadyStarted) if self.config.allow_spectators => {
                // Spectator: receives race traffic, never enters the roster.
                let state = self.races.state_of(race_id)?;
                self.rooms
                    .subscribe(&race_room(race_id), connection.clone());
                self.send(connection, ServerMessage::RaceJoined(state));
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Connection teardown: leave the current race (freeze if active),
    /// expire owned tests, unsubscribe everywhere.
    pub async fn handle_disconnect(&self, connection: &Arc<Connection>) {
        let race_id = *connection.current_race.lock().expect("race lock");
        if let Some(race_id) = race_id {
            if let Err(err) = self.races.leave(race_id, &connection.identity) {
                debug!(connection = %connection.id, %err, "race leave on disconnect failed");
            }
        }
        self.tests.handle_disconnect(connection.id);
        self.rooms.unsubscribe_all(connection);

        let last = self.registry.unregister(&connection.id);
        if last {
            self.presence.announce_offline(connection).await;
        }
    }

    fn in_a_race(&self, connection: &Arc<Connection>) -> bool {
        connection
            .current_race
            .lock()
            .expect("race lock")
            .is_some()
    }

    fn send(&self, connection: &Arc<Connection>, message: ServerMessage) {
        // At-most-once: a failed enqueue is logged and dropped; recovery is
        // the client's reconnect.
        let outcome = connection.send(message);
        if outcome == crate::outbound::PushOutcome::Closing {
            warn!(connection = %connection.id, "send to closing connection dropped");
        }
    }
}

/// Rate class per inbound event.
fn rate_class(message: &ClientMessage) -> RateClass {
    match message {
        ClientMessage::TestKeystroke(_) => RateClass::Keystroke,
        ClientMessage::RaceProgress(_) => RateClass::RaceProgress,
        ClientMessage::RaceMessage(_) => RateClass::Chat,
        _ => RateClass::General,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::SendQueue;
    use common::{Fanout, Identity};
    use external_services::{BuiltinWordSource, LogResultSink, StaticFriendGraph};

    fn make_router() -> (Arc<SessionRouter>, Arc<RoomFabric>) {
        let config = EngineConfig::default();
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomFabric::new());
        let words = Arc::new(BuiltinWordSource::new());
        let sink = Arc::new(LogResultSink);
        let fanout: Arc<dyn Fanout> = rooms.clone();

        let router = Arc::new(SessionRouter {
            registry: registry.clone(),
            rooms: rooms.clone(),
            governor: Arc::new(RateGovernor::new()),
            tests: Arc::new(TestStore::new(
                fanout.clone(),
                words.clone(),
                sink.clone(),
                config.clone(),
            )),
            races: Arc::new(RaceStore::new(fanout, words, sink, config.clone())),
            presence: Arc::new(PresenceTracker::new(
                Arc::new(StaticFriendGraph::new()),
                registry,
                rooms.clone(),
            )),
            config,
        });
        (router, rooms)
    }

    fn make_connection(user: &str) -> Arc<Connection> {
        Arc::new(Connection::new(
            Identity::new(user, user),
            None,
            Arc::new(SendQueue::new(256, 1 << 20)),
        ))
    }

    fn drain_types(connection: &Arc<Connection>) -> Vec<String> {
        connection
            .queue
            .pop_all()
            .into_iter()
            .map(|f| {
                let value: serde_json::Value = serde_json::from_str(&f.json).unwrap();
                value["type"].as_str().unwrap().to_string()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (router, _) = make_router();
        let connection = make_connection("alice");
        router.dispatch(&connection, r#"{"type":"ping"}"#).await;
        assert_eq!(drain_types(&connection), vec!["pong"]);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_validation_error() {
        let (router, _) = make_router();
        let connection = make_connection("alice");
        router
            .dispatch(&connection, r#"{"type":"race:join","payload":{}}"#)
            .await;

        let frames = connection.queue.pop_all();
        assert_eq!(frames.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&frames[0].json).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["payload"]["code"], 4002);
    }

    #[tokio::test]
    async fn test_start_flow_subscribes_and_joins() {
        let (router, rooms) = make_router();
        let connection = make_connection("alice");
        router
            .dispatch(
                &connection,
                r#"{"type":"test:start","payload":{"mode":"time","duration":30}}"#,
            )
            .await;

        assert_eq!(drain_types(&connection), vec!["test:joined"]);
        assert_eq!(connection.rooms.len(), 1);
        let room = connection.rooms.iter().next().unwrap().clone();
        assert!(room.starts_with("test:"));
        assert_eq!(rooms.subscriber_count(&room), 1);
    }

    #[tokio::test]
    async fn test_keystroke_burst_is_rate_limited_at_twenty() {
        let (router, _) = make_router();
        let connection = make_connection("alice");
        router
            .dispatch(
                &connection,
                r#"{"type":"test:start","payload":{"mode":"time","duration":30}}"#,
            )
            .await;
        let frames = connection.queue.pop_all();
        let value: serde_json::Value = serde_json::from_str(&frames[0].json).unwrap();
        let test_id = value["payload"]["testId"].as_str().unwrap().to_string();
        let first_char = value["payload"]["text"]
            .as_str()
            .unwrap()
            .chars()
            .next()
            .unwrap();

        for _ in 0..25 {
            let frame = format!(
                r#"{{"type":"test:keystroke","payload":{{"testId":"{}","timestamp":1,"key":"{}","correct":true,"position":0}}}}"#,
                test_id, first_char
            );
            router.dispatch(&connection, &frame).await;
        }

        let rate_errors = connection
            .queue
            .pop_all()
            .into_iter()
            .filter(|f| {
                let value: serde_json::Value = serde_json::from_str(&f.json).unwrap();
                value["type"] == "error" && value["payload"]["code"] == 4001
            })
            .count();
        assert_eq!(rate_errors, 5, "events 21..=25 must be rate limited");
    }

    #[tokio::test]
    async fn test_race_create_join_and_double_membership_guard() {
        let (router, _) = make_router();
        let alice = make_connection("alice");
        router
            .dispatch(
                &alice,
                r#"{"type":"race:create","payload":{"name":"sprint","mode":"words","wordCount":10,"maxPlayers":4}}"#,
            )
            .await;
        let frames = alice.queue.pop_all();
        let value: serde_json::Value = serde_json::from_str(&frames[0].json).unwrap();
        assert_eq!(value["type"], "race:created");
        let race_id = value["payload"]["race"]["raceId"].as_str().unwrap();

        // A second create from the same connection is rejected.
        router
            .dispatch(
                &alice,
                r#"{"type":"race:create","payload":{"name":"again","mode":"words","wordCount":10,"maxPlayers":4}}"#,
            )
            .await;
        let types = drain_types(&alice);
        assert_eq!(types, vec!["error"]);

        // Bob joins the existing race.
        let bob = make_connection("bob");
        let join = format!(
            r#"{{"type":"race:join","payload":{{"raceId":"{}"}}}}"#,
            race_id
        );
        router.dispatch(&bob, &join).await;
        let types = drain_types(&bob);
        assert!(types.contains(&"race:joined".to_string()));
    }

    #[tokio::test]
    async fn test_unknown_race_is_not_found() {
        let (router, _) = make_router();
        let connection = make_connection("alice");
        router
            .dispatch(
                &connection,
                r#"{"type":"race:join","payload":{"raceId":"4f3f9a2e-7e93-4f45-9b1e-1e6f9e1a2b3c"}}"#,
            )
            .await;
        let frames = connection.queue.pop_all();
        let value: serde_json::Value = serde_json::from_str(&frames[0].json).unwrap();
        assert_eq!(value["payload"]["code"], 2001);
    }

    #[tokio::test]
    async fn test_reconnecting_player_rejoins_active_race() {
        let (router, _) = make_router();
        let alice = make_connection("alice");
        router
            .dispatch(
                &alice,
                r#"{"type":"race:create","payload":{"name":"sprint","mode":"words","wordCount":10,"maxPlayers":4}}"#,
            )
            .await;
        let frames = alice.queue.pop_all();
        let value: serde_json::Value = serde_json::from_str(&frames[0].json).unwrap();
        let race_id = value["payload"]["race"]["raceId"].as_str().unwrap().to_string();

        // A fresh connection of the same identity re-joins: state, no
        // roster change.
        let alice2 = make_connection("alice");
        let join = format!(
            r#"{{"type":"race:join","payload":{{"raceId":"{}"}}}}"#,
            race_id
        );
        router.dispatch(&alice2, &join).await;

        let frames = alice2.queue.pop_all();
        let value: serde_json::Value = serde_json::from_str(&frames[0].json).unwrap();
        assert_eq!(value["type"], "race:joined");
        assert_eq!(value["payload"]["players"].as_array().unwrap().len(), 1);
    }
}
