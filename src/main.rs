use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use notify_gateway::AppState;
use notify_gateway::auth::{JwtAuthenticator, WsAuth};
use notify_gateway::config::Config;
use notify_gateway::gateway::NotificationGateway;
use notify_gateway::pubsub::EventPublisher;
use notify_gateway::relay;

#[tokio::main]
async fn main() {
    // Load .env if present; env vars may also be set externally.
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    let gateway = NotificationGateway::new(&config.redis_url, config.ws_event_name.clone())
        .expect("invalid redis url");

    let publish_client =
        redis::Client::open(config.redis_url.as_str()).expect("invalid redis url");
    let publisher = EventPublisher::new(publish_client, config.publish_timeout);

    tracing::info!(
        topic = %config.kafka.topic,
        group_id = %config.kafka.group_id,
        "spawning notification relay"
    );
    tokio::spawn(relay::run_relay(config.kafka.clone(), publisher));

    let state = AppState {
        gateway,
        auth: Arc::new(JwtAuthenticator::new(&config.jwt_secret)),
        config: Arc::new(config),
    };

    let app = Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(|| async { "OK" }))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "notify-gateway listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .expect("server error");
}

/// Upgrade an authenticated request into a gateway-managed connection.
/// `WsAuth` has already rejected anything without a valid credential.
async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    WsAuth(user_id): WsAuth,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| state.gateway.clone().handle_connection(socket, user_id))
}
