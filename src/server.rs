use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Extension, Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::auth::{require_auth, AuthenticatedUser, JwtVerifier};
use crate::config::IceConfig;
use crate::connection::{self, Connection, ConnectionSettings};
use crate::directory::{DeviceDirectory, DeviceRecord};
use crate::hub::Hub;
use crate::protocol::DeviceInfo;
use crate::telemetry::HubStatsSnapshot;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub directory: Arc<dyn DeviceDirectory>,
    pub verifier: Arc<JwtVerifier>,
    pub ice: Arc<IceConfig>,
    pub settings: ConnectionSettings,
}

pub fn router(state: AppState) -> Router {
    let authenticated_routes = Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/api/v1/webrtc/ice-servers", get(ice_servers))
        .route("/api/v1/devices/online", get(online_devices))
        .route("/api/v1/devices/:id/online", get(device_online))
        .route_layer(axum::middleware::from_fn_with_state(
            state.verifier.clone(),
            require_auth,
        ))
        .with_state(state.clone());

    Router::new()
        .route("/ping", get(|| async { "pong" }))
        .route("/health", get(health))
        .with_state(state)
        .merge(authenticated_routes)
}

pub async fn serve(listener: TcpListener, app: Router, shutdown: Arc<Notify>) -> Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.notified().await;
        })
        .await
        .context("http server")
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

#[derive(Deserialize)]
struct WsQuery {
    #[serde(default)]
    device_id: Option<String>,
}

/// Resolves the `device_id` query parameter to a device owned by `user`.
/// Runs before the upgrade so refusals are plain HTTP responses.
async fn authorize_device(
    state: &AppState,
    user: AuthenticatedUser,
    query: WsQuery,
) -> Result<DeviceRecord, Response> {
    let Some(raw) = query.device_id.filter(|d| !d.trim().is_empty()) else {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "device_id query parameter required",
        ));
    };
    let Ok(device_id) = Uuid::parse_str(raw.trim()) else {
        return Err(error_response(StatusCode::BAD_REQUEST, "invalid device_id"));
    };

    let record = match state.directory.find_device(device_id).await {
        Ok(Some(record)) => record,
        Ok(None) => return Err(error_response(StatusCode::NOT_FOUND, "device not found")),
        Err(err) => {
            tracing::error!(error = %err, device_id = %device_id, "failed to get device");
            return Err(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error",
            ));
        }
    };
    if record.user_id != user.user_id {
        return Err(error_response(
            StatusCode::FORBIDDEN,
            "device not owned by user",
        ));
    }
    Ok(record)
}

async fn ws_upgrade(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let record = match authorize_device(&state, user, query).await {
        Ok(record) => record,
        Err(rejection) => return rejection,
    };
    let device_id = record.id;

    let hub = state.hub.handle();
    let settings = state.settings.clone();
    let snapshot = record.online_snapshot();
    ws.max_message_size(settings.max_message_bytes)
        .on_upgrade(move |socket| async move {
            let (conn, rx) = Connection::new(
                user.user_id,
                device_id,
                snapshot,
                settings.send_queue_capacity,
            );
            if let Err(err) = hub.register(conn.clone()).await {
                tracing::warn!(
                    user_id = %user.user_id,
                    device_id = %device_id,
                    error = %err,
                    "dropping websocket, hub unavailable"
                );
                return;
            }
            connection::run(conn, rx, socket, hub, settings).await;
        })
}

#[derive(Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub credential: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct IceServersResponse {
    pub ice_servers: Vec<IceServer>,
}

async fn ice_servers(State(state): State<AppState>) -> Json<IceServersResponse> {
    let ice = &state.ice;
    let stun = ice.stun_servers.iter().map(|url| IceServer {
        urls: vec![url.clone()],
        username: None,
        credential: None,
    });
    let turn = ice.turn_servers.iter().map(|url| IceServer {
        urls: vec![url.clone()],
        username: Some(ice.turn_username.clone()),
        credential: Some(ice.turn_credential.clone()),
    });
    Json(IceServersResponse {
        ice_servers: stun.chain(turn).collect(),
    })
}

#[derive(Serialize, Deserialize)]
pub struct OnlineDevicesResponse {
    pub devices: Vec<DeviceInfo>,
}

async fn online_devices(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Json<OnlineDevicesResponse> {
    Json(OnlineDevicesResponse {
        devices: state.hub.online_devices(user.user_id),
    })
}

#[derive(Serialize, Deserialize)]
pub struct DeviceOnlineResponse {
    pub device_id: Uuid,
    pub online: bool,
}

async fn device_online(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(device_id): Path<Uuid>,
) -> Json<DeviceOnlineResponse> {
    Json(DeviceOnlineResponse {
        device_id,
        online: state.hub.is_device_online(user.user_id, device_id),
    })
}

#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(rename = "ts")]
    pub timestamp: String,
    pub version: String,
    pub connections: usize,
    pub hub: HubStatsSnapshot,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let status = if state.hub.is_shut_down() {
        "stopping"
    } else {
        "ok"
    };
    Json(HealthResponse {
        status: status.to_string(),
        timestamp: Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        connections: state.hub.connection_count(),
        hub: state.hub.stats().snapshot(),
    })
}
