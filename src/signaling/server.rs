//! HTTP + WebSocket front of the signaling hub

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::Response,
    routing::{delete, get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use super::hub::SignalingHub;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::room::{AccessCheck, RoomCredentials, RoomRegistry};

/// Shared state of the HTTP handlers
#[derive(Clone)]
pub struct ServerState {
    pub hub: Arc<SignalingHub>,
    pub heartbeat: Duration,
}

impl ServerState {
    pub fn new(registry: Arc<RoomRegistry>, heartbeat: Duration) -> Self {
        Self {
            hub: Arc::new(SignalingHub::new(registry)),
            heartbeat,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateRequest {
    pub room_id: String,
    pub pin: String,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/rooms", post(create_room))
        .route("/rooms/validate", post(validate_room))
        .route("/rooms/:room_id", delete(delete_room))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn create_room(State(state): State<ServerState>) -> Result<(StatusCode, Json<RoomCredentials>)> {
    let credentials = state.hub.registry().create_room()?;
    Ok((StatusCode::CREATED, Json(credentials)))
}

async fn validate_room(
    State(state): State<ServerState>,
    Json(req): Json<ValidateRequest>,
) -> Json<AccessCheck> {
    Json(state.hub.registry().validate_access(&req.room_id, &req.pin))
}

async fn delete_room(State(state): State<ServerState>, Path(room_id): Path<String>) -> StatusCode {
    if state.hub.registry().delete_room(&room_id) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn health(State(state): State<ServerState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "rooms": state.hub.registry().room_count(),
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: ServerState) {
    let (mut sender, mut receiver) = socket.split();
    let (conn, mut outbound) = state.hub.attach().await;
    info!("Signaling client {} connected", conn);

    let mut heartbeat = tokio::time::interval(state.heartbeat);

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        // Failures were already reported to the client
                        let _ = state.hub.handle_text(conn, &text).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        debug!("Pong from client {}", conn);
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Signaling client {} disconnected", conn);
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("Signaling client {} receive error: {}", conn, e);
                        break;
                    }
                    _ => {}
                }
            }

            msg = outbound.recv() => {
                let Some(msg) = msg else { break };
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode message for client {}: {}", conn, e);
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    warn!("Failed to send to client {}, disconnecting", conn);
                    break;
                }
            }

            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(vec![])).await.is_err() {
                    warn!("Failed to ping client {}, disconnecting", conn);
                    break;
                }
            }
        }
    }

    state.hub.detach(conn).await;
}

/// Run the signaling server until Ctrl-C
pub async fn serve(config: ServerConfig) -> Result<()> {
    let registry = Arc::new(RoomRegistry::new(&config));
    let sweeper = registry.spawn_sweeper(config.sweep_interval());
    let state = ServerState::new(Arc::clone(&registry), config.heartbeat());

    let addr: SocketAddr = config
        .bind
        .parse()
        .map_err(|e| Error::Config(format!("invalid bind address {}: {}", config.bind, e)))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Signaling server listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Shutdown signal received");
        })
        .await?;

    sweeper.shutdown().await;
    info!("Signaling server stopped");
    Ok(())
}
