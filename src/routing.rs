//! HTTP routing configuration
//!
//! Thin wrappers over the coordinator: authenticate the bearer credential,
//! call the operation, map failure kinds to status classes. No coordination
//! logic lives here.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::error;

use crate::auth;
use crate::chats::MutationOutcome;
use crate::error::CoordError;
use crate::events::UserId;
use crate::websocket::ServerState;

/// Create the application router
pub fn create_router(state: Arc<ServerState>) -> Router {
    let cors = build_cors_layer(&state.config.cors_origins);

    let mut router = Router::new()
        .route("/ws", get(crate::websocket::handle_websocket))
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/chats/direct", post(create_direct))
        .route("/chats/group", post(create_group))
        .route("/chats/:id", get(get_chat).delete(delete_chat))
        .route("/chats/:id/name", patch(rename_chat))
        .route("/chats/:id/about", patch(update_about))
        .route("/chats/:id/picture", patch(update_picture))
        .route("/chats/:id/members", post(add_members))
        .route("/chats/:id/members/:user_id", delete(remove_member))
        .route("/chats/:id/admin", post(transfer_admin))
        .route("/chats/:id/messages", get(list_messages).post(send_message));

    // Only mount admin endpoint if a token is configured
    if state.config.admin_token.is_some() {
        router = router.route("/admin/stats", get(admin_stats));
    }

    router
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Build CORS layer from config. Permissive when no origins are configured.
fn build_cors_layer(origins: &Option<String>) -> CorsLayer {
    match origins {
        Some(list) if !list.is_empty() => {
            let parsed: Vec<_> = list
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            CorsLayer::new().allow_origin(AllowOrigin::list(parsed))
        }
        _ => CorsLayer::permissive(),
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Maps the core's failure kinds onto HTTP status classes. Internal detail
/// is logged, never sent to the client.
struct ApiError(CoordError);

impl From<CoordError> for ApiError {
    fn from(err: CoordError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            CoordError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            CoordError::Unauthenticated(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            CoordError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            CoordError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            CoordError::Internal(e) => {
                error!("Internal failure: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Request failed".to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

fn chat_response(outcome: MutationOutcome) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "chat": outcome.chat,
        "degraded": outcome.degraded,
    }))
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CreateDirectBody {
    target: String,
}

#[derive(Deserialize)]
struct CreateGroupBody {
    name: String,
    members: Vec<UserId>,
    about: Option<String>,
}

#[derive(Deserialize)]
struct NameBody {
    name: String,
}

#[derive(Deserialize)]
struct AboutBody {
    about: String,
}

#[derive(Deserialize)]
struct PictureBody {
    picture: String,
}

#[derive(Deserialize)]
struct AddMembersBody {
    members: Vec<UserId>,
}

#[derive(Deserialize)]
struct AdminBody {
    new_admin: String,
}

#[derive(Deserialize)]
struct MessageBody {
    content: String,
}

// ---------------------------------------------------------------------------
// Mutation entry points
// ---------------------------------------------------------------------------

async fn create_direct(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(body): Json<CreateDirectBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = auth::bearer_user(&state.db_pool, &headers).await?;
    let outcome = state.coordinator.create_direct(&user, &body.target).await?;
    Ok(chat_response(outcome))
}

async fn create_group(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(body): Json<CreateGroupBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = auth::bearer_user(&state.db_pool, &headers).await?;
    let outcome = state
        .coordinator
        .create_group(&user, &body.name, &body.members, body.about.as_deref())
        .await?;
    Ok(chat_response(outcome))
}

async fn get_chat(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = auth::bearer_user(&state.db_pool, &headers).await?;
    let outcome = state.coordinator.get_chat(&user, &chat_id).await?;
    Ok(chat_response(outcome))
}

async fn rename_chat(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
    Json(body): Json<NameBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = auth::bearer_user(&state.db_pool, &headers).await?;
    let outcome = state.coordinator.rename(&user, &chat_id, &body.name, None).await?;
    Ok(chat_response(outcome))
}

async fn update_about(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
    Json(body): Json<AboutBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = auth::bearer_user(&state.db_pool, &headers).await?;
    let outcome = state.coordinator.update_about(&user, &chat_id, &body.about, None).await?;
    Ok(chat_response(outcome))
}

async fn update_picture(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
    Json(body): Json<PictureBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = auth::bearer_user(&state.db_pool, &headers).await?;
    let outcome = state.coordinator.update_picture(&user, &chat_id, &body.picture, None).await?;
    Ok(chat_response(outcome))
}

async fn add_members(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
    Json(body): Json<AddMembersBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = auth::bearer_user(&state.db_pool, &headers).await?;
    let outcome = state.coordinator.add_members(&user, &chat_id, &body.members, None).await?;
    Ok(chat_response(outcome))
}

async fn remove_member(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path((chat_id, user_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = auth::bearer_user(&state.db_pool, &headers).await?;
    let outcome = state.coordinator.remove_member(&user, &chat_id, &user_id, None).await?;
    Ok(chat_response(outcome))
}

async fn transfer_admin(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
    Json(body): Json<AdminBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = auth::bearer_user(&state.db_pool, &headers).await?;
    let outcome = state.coordinator.transfer_admin(&user, &chat_id, &body.new_admin, None).await?;
    Ok(chat_response(outcome))
}

async fn delete_chat(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = auth::bearer_user(&state.db_pool, &headers).await?;
    state.coordinator.delete(&user, &chat_id).await?;
    Ok(Json(serde_json::json!({ "deleted": chat_id })))
}

async fn list_messages(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = auth::bearer_user(&state.db_pool, &headers).await?;
    let messages = state.coordinator.list_messages(&user, &chat_id).await?;
    Ok(Json(serde_json::json!({ "messages": messages })))
}

async fn send_message(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
    Json(body): Json<MessageBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = auth::bearer_user(&state.db_pool, &headers).await?;
    let message = state.coordinator.send_message(&user, &chat_id, &body.content).await?;
    Ok(Json(serde_json::json!({ "message": message })))
}

// ---------------------------------------------------------------------------
// Service endpoints
// ---------------------------------------------------------------------------

/// Health check — no sensitive data
async fn health_check() -> &'static str {
    "OK"
}

/// Server info — only protocol version (no version/feature leakage)
async fn server_info() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "Huddle Server",
        "protocol_version": 1,
    }))
}

/// Admin stats — protected by bearer token
async fn admin_stats(
    headers: HeaderMap,
    State(state): State<Arc<ServerState>>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let expected = state.config.admin_token.as_deref().ok_or(StatusCode::NOT_FOUND)?;

    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    // Constant-time comparison to prevent timing attacks
    use subtle::ConstantTimeEq;
    if expected.as_bytes().ct_eq(provided.as_bytes()).into() {
        Ok(Json(serde_json::json!({
            "connected_sockets": state.rooms.connection_count(),
            "online_users": state.presence.online_users().len(),
            "active_rooms": state.rooms.room_count(),
            "max_connections": state.config.max_connections,
        })))
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}
