//! Gateway service entry point.
//!
//! Real-time WebSocket engine for the typerush typing-test service.

use anyhow::Result;
use common::{EngineConfig, Fanout};
use external_services::{
    BuiltinWordSource, HmacTokenVerifier, LogResultSink, StaticFriendGraph,
};
use gateway::{
    create_router, housekeeping, AppState, AuthGate, ConnectionRegistry, PresenceTracker,
    RateGovernor, RoomFabric, SessionRouter,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use race_engine::RaceStore;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use test_engine::TestStore;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEV_AUTH_SECRET: &str = "typerush-dev-secret";

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting typerush gateway");

    let http_port: u16 = env::var("HTTP_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .expect("HTTP_PORT must be a number");
    let metrics_port: u16 = env::var("METRICS_PORT")
        .unwrap_or_else(|_| "9100".to_string())
        .parse()
        .expect("METRICS_PORT must be a number");
    let auth_secret = env::var("AUTH_SECRET").unwrap_or_else(|_| {
        warn!("AUTH_SECRET not set; using the development secret");
        DEV_AUTH_SECRET.to_string()
    });

    let config = EngineConfig::from_env();
    info!(?config, http_port, metrics_port, "configuration loaded");

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], metrics_port))
        .install()
        .expect("Failed to start Prometheus exporter");
    info!("Prometheus metrics server started on port {}", metrics_port);

    // Collaborators: swapped for real backends in deployment.
    let verifier = Arc::new(HmacTokenVerifier::new(auth_secret.into_bytes()));
    let words = Arc::new(BuiltinWordSource::new());
    let sink = Arc::new(LogResultSink);
    let friends = Arc::new(StaticFriendGraph::new());

    // Engine root: explicit handles, no module-level state.
    let registry = Arc::new(ConnectionRegistry::new());
    let rooms = Arc::new(RoomFabric::new());
    let fanout: Arc<dyn Fanout> = rooms.clone();
    let governor = Arc::new(RateGovernor::new());
    let tests = Arc::new(TestStore::new(
        fanout.clone(),
        words.clone(),
        sink.clone(),
        config.clone(),
    ));
    let races = Arc::new(RaceStore::new(fanout, words, sink, config.clone()));
    let presence = Arc::new(PresenceTracker::new(
        friends,
        registry.clone(),
        rooms.clone(),
    ));

    let router = Arc::new(SessionRouter {
        registry,
        rooms,
        governor,
        tests,
        races,
        presence,
        config: config.clone(),
    });

    let auth = Arc::new(AuthGate::new(verifier, config.max_connections_per_identity));

    let sweeper = housekeeping::spawn(router.clone());

    let state = Arc::new(AppState { router, auth });
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    sweeper.abort();
    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
