//! Diagnostics API
//!
//! Read-only views of devices and their pending commands, a resync trigger
//! and a WebSocket streaming conductor events.
//! Default port: 8125

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::command::PendingCommand;
use crate::conductor::{Conductor, DeviceInfo};
use crate::devices::DeviceStatus;
use crate::events::Event;

/// Shared state for API handlers
pub struct ApiState {
    pub conductor: Arc<Conductor>,
}

/// API error response
#[derive(Debug, Serialize)]
struct ApiError {
    #[serde(skip)]
    status: StatusCode,
    error: String,
}

impl ApiError {
    fn unknown_device(device_id: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: format!(
                "Unknown device '{}'. Use GET /api/devices to list devices.",
                device_id
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub device_id: String,
    pub connected: bool,
    #[serde(flatten)]
    pub status: DeviceStatus,
}

#[derive(Debug, Serialize)]
pub struct ResyncResponse {
    pub ok: bool,
    pub devices: usize,
}

/// Optional `?device=<id>` filter for event streams
#[derive(Debug, Default, Deserialize)]
pub struct EventFilter {
    pub device: Option<String>,
}

/// Build the API router
pub fn build_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/devices", get(list_devices))
        .route("/api/devices/:id/status", get(device_status))
        .route("/api/devices/:id/queue", get(device_queue))
        .route("/api/queue", get(full_queue))
        .route("/api/resync", post(resync))
        .route("/api/events", get(events_ws))
        .route("/api/health", get(health_check))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// GET /api/devices - Registered devices with status and queue size
async fn list_devices(State(state): State<Arc<ApiState>>) -> Json<Vec<DeviceInfo>> {
    Json(state.conductor.device_infos())
}

/// GET /api/devices/:id/status
async fn device_status(
    Path(device_id): Path<String>,
    State(state): State<Arc<ApiState>>,
) -> Result<Json<StatusResponse>, ApiError> {
    let device = state
        .conductor
        .device(&device_id)
        .ok_or_else(|| ApiError::unknown_device(&device_id))?;
    Ok(Json(StatusResponse {
        device_id,
        connected: device.connected(),
        status: device.status(),
    }))
}

/// GET /api/devices/:id/queue - Pending commands of one device
async fn device_queue(
    Path(device_id): Path<String>,
    State(state): State<Arc<ApiState>>,
) -> Result<Json<Vec<PendingCommand>>, ApiError> {
    let device = state
        .conductor
        .device(&device_id)
        .ok_or_else(|| ApiError::unknown_device(&device_id))?;
    Ok(Json(device.queue()))
}

/// GET /api/queue - Every pending command
async fn full_queue(State(state): State<Arc<ApiState>>) -> Json<Vec<PendingCommand>> {
    Json(state.conductor.queue(None))
}

/// POST /api/resync - Resend the full state of every device
async fn resync(State(state): State<Arc<ApiState>>) -> Json<ResyncResponse> {
    let devices = state.conductor.resync().await;
    info!("🔄 Resync requested over API ({} devices)", devices);
    Json(ResyncResponse { ok: true, devices })
}

/// GET /api/events - WebSocket streaming conductor events
async fn events_ws(
    ws: WebSocketUpgrade,
    Query(filter): Query<EventFilter>,
    State(state): State<Arc<ApiState>>,
) -> impl IntoResponse {
    let rx = state.conductor.subscribe();
    ws.on_upgrade(move |socket| handle_websocket(socket, rx, filter))
}

fn wanted(event: &Event, filter: &EventFilter) -> bool {
    match (&filter.device, event.device_id()) {
        (None, _) => true,
        (Some(wanted), Some(device_id)) => wanted == device_id,
        (Some(_), None) => false,
    }
}

async fn handle_websocket(
    mut socket: WebSocket,
    mut rx: broadcast::Receiver<Event>,
    filter: EventFilter,
) {
    debug!("WebSocket client connected for events");

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if !wanted(&event, &filter) {
                            continue;
                        }
                        let msg = match serde_json::to_string(&event) {
                            Ok(msg) => msg,
                            Err(e) => {
                                warn!("Failed to serialize event: {}", e);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(msg)).await.is_err() {
                            debug!("WebSocket client disconnected");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Event channel closed");
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("WebSocket client lagged by {} events", n);
                    }
                }
            }
            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("WebSocket client closed connection");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                }
            }
        }
    }
}

/// GET /api/health - Health check endpoint
async fn health_check() -> &'static str {
    "ok"
}

/// Start the API server
pub async fn start_server(state: Arc<ApiState>, port: u16) -> Result<()> {
    let router = build_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("🌐 Diagnostics API listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind API server")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
