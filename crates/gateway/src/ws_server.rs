//! WebSocket server handler using Axum.

use crate::auth::{extract_token, AuthGate};
use crate::client::Connection;
use crate::outbound::{CloseReason, SendQueue};
use crate::ratelimit::RateClass;
use crate::router::SessionRouter;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, RawQuery, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::Utc;
use common::{user_room, ErrorPayload, OutboundFrame, ServerMessage};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, timeout};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// Outbound network sends time out after this long.
const SEND_DEADLINE: Duration = Duration::from_secs(5);

/// Keepalive ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Shared application state.
pub struct AppState {
    pub router: Arc<SessionRouter>,
    pub auth: Arc<AuthGate>,
}

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    format!(
        r#"{{"status":"ok","connections":{},"rooms":{},"tests":{},"races":{}}}"#,
        state.router.registry.connection_count(),
        state.router.rooms.room_count(),
        state.router.tests.session_count(),
        state.router.races.race_count(),
    )
}

/// WebSocket upgrade handler. The handshake rate limit is enforced before
/// the upgrade, keyed by remote address; authentication happens on the
/// socket so the client receives a proper error envelope.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let decision = state.router.governor.check(
        &addr.ip().to_string(),
        RateClass::Connection,
        Utc::now().timestamp_millis(),
    );
    if !decision.allowed {
        counter!("gateway_handshakes_limited_total").increment(1);
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    let token = extract_token(query.as_deref(), &headers);
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr, token))
        .into_response()
}

/// Handle one WebSocket connection for its whole lifetime.
async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    addr: SocketAddr,
    token: Option<String>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let identity = match state
        .auth
        .authenticate(&state.router.registry, token.as_deref())
        .await
    {
        Ok(identity) => identity,
        Err(denied) => {
            counter!("gateway_auth_failures_total").increment(1);
            let frame = OutboundFrame::new(ServerMessage::Error(ErrorPayload::new(
                denied.wire_code(),
                denied.message(),
            )));
            if let Ok(json) = serde_json::to_string(&frame) {
                let _ = timeout(SEND_DEADLINE, ws_tx.send(Message::Text(json.into()))).await;
            }
            let _ = ws_tx.send(Message::Close(None)).await;
            return;
        }
    };

    let config = &state.router.config;
    let queue = Arc::new(SendQueue::new(
        config.send_queue_max_messages,
        config.send_queue_max_bytes,
    ));
    let connection = Arc::new(Connection::new(identity, Some(addr), queue.clone()));
    let connection_id = connection.id;

    state.router.registry.register(connection.clone());
    state
        .router
        .rooms
        .subscribe(&user_room(&connection.identity.id), connection.clone());

    // Announce presence on the identity's first connection only.
    if state
        .router
        .registry
        .sockets_of(&connection.identity.id)
        .len()
        == 1
    {
        state.router.presence.announce_online(&connection).await;
    }

    counter!("gateway_connections_total").increment(1);
    info!(connection = %connection_id, user = %connection.identity.username, %addr, "client connected");

    // Writer: drains the bounded queue into the socket and owns the
    // keepalive ping. A queue closed for slow consumption tells the client
    // why before the close frame.
    let writer_queue = queue.clone();
    let send_task = tokio::spawn(async move {
        let mut ping_interval = interval(PING_INTERVAL);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            for frame in writer_queue.pop_all() {
                let send = ws_tx.send(Message::Text(frame.json.into()));
                match timeout(SEND_DEADLINE, send).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) | Err(_) => return,
                }
            }
            if let Some(reason) = writer_queue.closed() {
                if reason == CloseReason::SlowConsumer {
                    let frame = OutboundFrame::new(ServerMessage::Error(ErrorPayload::new(
                        common::ErrorCode::SlowConsumer,
                        "outbound queue overflowed; reconnect",
                    )));
                    if let Ok(json) = serde_json::to_string(&frame) {
                        let _ =
                            timeout(SEND_DEADLINE, ws_tx.send(Message::Text(json.into()))).await;
                    }
                }
                let _ = ws_tx.send(Message::Close(None)).await;
                return;
            }
            tokio::select! {
                _ = writer_queue.wait() => {}
                _ = ping_interval.tick() => {
                    let send = ws_tx.send(Message::Ping(Vec::new().into()));
                    match timeout(SEND_DEADLINE, send).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) | Err(_) => return,
                    }
                }
            }
        }
    });

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                state.router.dispatch(&connection, &text).await;
            }
            Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                Ok(text) => state.router.dispatch(&connection, text).await,
                Err(_) => debug!(connection = %connection_id, "dropped non-utf8 binary frame"),
            },
            Ok(Message::Pong(_)) => {
                connection.touch();
            }
            Ok(Message::Ping(_)) => {
                // The socket layer answers pings; just record life.
                connection.touch();
            }
            Ok(Message::Close(_)) => break,
            Err(err) => {
                warn!(connection = %connection_id, %err, "websocket error");
                break;
            }
        }
    }

    state.router.handle_disconnect(&connection).await;
    queue.close(CloseReason::Gone);
    send_task.abort();

    counter!("gateway_disconnections_total").increment(1);
    info!(connection = %connection_id, "client disconnected");
}
