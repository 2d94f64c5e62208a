use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

use axum::async_trait;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::{header, request::Parts, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::info;

use crate::protocol::RelayError;
use crate::rooms::ConnectionHandle;
use crate::state::AppState;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("authentication required")]
    Unauthorized,
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, json!("UNAUTHORIZED")),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, json!("NOT_FOUND")),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, json!("CODE_CONFLICT")),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, json!("BAD_REQUEST")),
            ApiError::Relay(err) => {
                let status = match err {
                    RelayError::RoomCodeNotFound(_)
                    | RelayError::PeerNotFound(_)
                    | RelayError::UnknownConnection(_) => StatusCode::NOT_FOUND,
                    _ => StatusCode::BAD_REQUEST,
                };
                let code = serde_json::to_value(err.code()).unwrap_or_else(|_| json!("INTERNAL"));
                (status, code)
            }
        };
        let body = Json(json!({ "error": error, "message": self.to_string() }));
        if matches!(self, ApiError::Unauthorized) {
            return (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Basic realm=\"peddlenet-admin\"")],
                body,
            )
                .into_response();
        }
        (status, body).into_response()
    }
}

/// Guards the admin surface. All operators share one Basic credential pair
/// configured at startup.
pub struct AdminAuth;

#[async_trait]
impl FromRequestParts<AppState> for AdminAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header_value = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;
        let encoded = header_value
            .strip_prefix("Basic ")
            .ok_or(ApiError::Unauthorized)?;
        let decoded = BASE64
            .decode(encoded.trim())
            .map_err(|_| ApiError::Unauthorized)?;
        let decoded = String::from_utf8(decoded).map_err(|_| ApiError::Unauthorized)?;
        let (username, password) = decoded.split_once(':').ok_or(ApiError::Unauthorized)?;
        if state.verify_admin(username, password) {
            Ok(AdminAuth)
        } else {
            Err(ApiError::Unauthorized)
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterCodeRequest {
    room_id: String,
    #[serde(default)]
    room_code: Option<String>,
    #[serde(default)]
    overwrite: bool,
}

#[derive(Debug, Deserialize)]
struct ActivityQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct BroadcastRequest {
    message: String,
}

#[derive(Debug, Deserialize)]
struct TargetedBroadcastRequest {
    message: String,
    targets: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClearRoomRequest {
    #[serde(alias = "roomCode", alias = "roomId")]
    room_code_or_id: String,
}

#[derive(Debug, Deserialize)]
struct WipeRequest {
    confirm: String,
}

pub fn router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/analytics", get(admin_analytics))
        .route("/activity", get(admin_activity))
        .route("/users/detailed", get(admin_users_detailed))
        .route("/rooms/detailed", get(admin_rooms_detailed))
        .route("/broadcast", post(admin_broadcast))
        .route("/broadcast/room", post(admin_broadcast_rooms))
        .route("/room/clear", post(admin_clear_room))
        .route("/database/wipe", post(admin_wipe));

    Router::new()
        .route("/health", get(health))
        .route("/register-room-code", post(register_room_code))
        .route("/resolve-room-code/:code", get(resolve_room_code))
        .route("/room-stats/:room_id", get(room_stats))
        .route("/metrics", get(metrics))
        .nest("/admin", admin)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "peddlenet-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSeconds": state.uptime_seconds(),
        "activeConnections": state.registry.connection_count(),
        "activeRooms": state.registry.active_room_count(),
    }))
}

async fn register_room_code(
    State(state): State<AppState>,
    admin: Option<AdminAuth>,
    Json(request): Json<RegisterCodeRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.room_id.trim().is_empty() {
        return Err(ApiError::BadRequest("roomId is required".to_string()));
    }
    let code = match request.room_code.as_deref().map(str::trim) {
        Some(code) if !code.is_empty() => {
            // Overwriting an existing mapping is an operator-only move.
            let overwrite = request.overwrite && admin.is_some();
            state
                .codes
                .register(&request.room_id, code, overwrite)
                .map_err(|conflict| ApiError::Conflict(conflict.to_string()))?;
            state
                .codes
                .code_for_room(&request.room_id)
                .unwrap_or_else(|| code.to_lowercase())
        }
        _ => state.codes.register_derived(&request.room_id),
    };
    info!(room = %request.room_id, code = %code, "room code registered");
    Ok(Json(json!({
        "success": true,
        "roomId": request.room_id,
        "roomCode": code,
    })))
}

async fn resolve_room_code(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.codes.resolve(&code) {
        Some(room_id) => Ok(Json(json!({
            "roomId": room_id,
            "roomCode": code.trim().to_lowercase(),
        }))),
        None => Err(RelayError::RoomCodeNotFound(code).into()),
    }
}

async fn room_stats(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state
        .registry
        .room_record(&room_id)
        .ok_or_else(|| ApiError::NotFound(format!("room {room_id} not found")))?;
    let members = state.registry.member_snapshot(&room_id).await;
    Ok(Json(json!({
        "roomId": record.room_id,
        "active": state.registry.is_room_active(&room_id),
        "memberCount": members.len(),
        "members": members,
        "totalUsers": record.total_users,
        "totalMessages": record.total_messages,
        "createdAt": record.created_at,
        "lastActivity": record.last_activity,
        "roomCode": state.codes.code_for_room(&room_id),
        "bufferedMessages": state.store.buffered_len(&room_id).await,
    })))
}

async fn metrics(State(state): State<AppState>) -> String {
    state
        .prometheus
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default()
}

async fn admin_analytics(_auth: AdminAuth, State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "connections": state.registry.connection_count(),
        "uniqueActiveUsers": state.registry.unique_peer_count(),
        "activeRooms": state.registry.active_room_count(),
        "roomsEverCreated": state.registry.rooms_ever_created(),
        "totalMessages": state.activity.messages_total(),
        "messagesPerMinute": state.activity.messages_per_minute(),
        "notificationSubscriptions": state.subscriptions.total_subscriptions(),
        "pendingSignals": state.relay.pending_count(),
        "registeredCodes": state.codes.len(),
        "uptimeSeconds": state.uptime_seconds(),
    }))
}

async fn admin_activity(
    _auth: AdminAuth,
    State(state): State<AppState>,
    Query(query): Query<ActivityQuery>,
) -> Json<Value> {
    let limit = query.limit.unwrap_or(50).min(1000);
    let events = state.activity.recent(limit);
    Json(json!({ "count": events.len(), "events": events }))
}

async fn admin_users_detailed(_auth: AdminAuth, State(state): State<AppState>) -> Json<Value> {
    let connections = state.registry.connections_snapshot();
    let mut rooms: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    let mut lobby = Vec::new();
    for handle in &connections {
        match &handle.room_id {
            Some(room_id) => rooms
                .entry(room_id.clone())
                .or_default()
                .push(connection_json(handle)),
            None => lobby.push(connection_json(handle)),
        }
    }
    let rooms: Vec<Value> = rooms
        .into_iter()
        .map(|(room_id, members)| {
            json!({ "roomId": room_id, "memberCount": members.len(), "members": members })
        })
        .collect();
    Json(json!({
        "totalConnections": connections.len(),
        "uniqueActiveUsers": state.registry.unique_peer_count(),
        "rooms": rooms,
        "lobby": lobby,
    }))
}

async fn admin_rooms_detailed(_auth: AdminAuth, State(state): State<AppState>) -> Json<Value> {
    let mut records = state.registry.room_records();
    records.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
    let mut rooms = Vec::with_capacity(records.len());
    for record in records {
        let members = state.registry.member_snapshot(&record.room_id).await;
        rooms.push(json!({
            "roomId": record.room_id,
            "active": state.registry.is_room_active(&record.room_id),
            "createdAt": record.created_at,
            "lastActivity": record.last_activity,
            "totalUsers": record.total_users,
            "totalMessages": record.total_messages,
            "memberCount": members.len(),
            "members": members,
            "roomCode": state.codes.code_for_room(&record.room_id),
            "bufferedMessages": state.store.buffered_len(&record.room_id).await,
        }));
    }
    Json(json!({ "count": rooms.len(), "rooms": rooms }))
}

async fn admin_broadcast(
    _auth: AdminAuth,
    State(state): State<AppState>,
    Json(request): Json<BroadcastRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message is required".to_string()));
    }
    let report = state.broadcast_to_all_rooms(request.message.trim()).await;
    Ok(Json(json!({ "success": true, "rooms": report.rooms, "delivered": report.delivered })))
}

async fn admin_broadcast_rooms(
    _auth: AdminAuth,
    State(state): State<AppState>,
    Json(request): Json<TargetedBroadcastRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message is required".to_string()));
    }
    if request.targets.is_empty() {
        return Err(ApiError::BadRequest("at least one target is required".to_string()));
    }
    let outcomes = state
        .broadcast_to_rooms(request.message.trim(), &request.targets)
        .await;
    let failed = outcomes.iter().filter(|outcome| outcome.error.is_some()).count();
    Ok(Json(json!({
        "success": failed == 0,
        "failed": failed,
        "results": outcomes,
    })))
}

async fn admin_clear_room(
    _auth: AdminAuth,
    State(state): State<AppState>,
    Json(request): Json<ClearRoomRequest>,
) -> Result<Json<Value>, ApiError> {
    let (room_id, cleared) = state.clear_room_by_target(&request.room_code_or_id).await?;
    info!(room = %room_id, cleared, "cleared room history");
    Ok(Json(
        json!({ "success": true, "roomId": room_id, "messagesCleared": cleared }),
    ))
}

async fn admin_wipe(
    _auth: AdminAuth,
    State(state): State<AppState>,
    Json(request): Json<WipeRequest>,
) -> Result<Json<Value>, ApiError> {
    let report = state.wipe_all(&request.confirm).await?;
    Ok(Json(json!({
        "success": true,
        "disconnected": report.disconnected,
        "messagesCleared": report.messages_cleared,
    })))
}

fn connection_json(handle: &ConnectionHandle) -> Value {
    json!({
        "connectionId": handle.connection_id,
        "peerId": handle.peer_id,
        "displayName": handle.display_name,
        "roomId": handle.room_id,
        "connectedAt": handle.connected_at,
        "joinedAt": handle.joined_at,
        "lastSeen": handle.last_seen.load(Ordering::Relaxed),
    })
}
