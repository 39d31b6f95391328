//! Room listing, history and publish endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::middleware::AuthUser;
use crate::chat::{Gap, Message, RoomSummary};
use crate::error::{ApiError, ApiErrorBody};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/rooms", get(list_rooms)).route(
        "/rooms/{room_id}/messages",
        get(list_messages).post(send_message),
    )
}

// ---------------------------------------------------------------------------
// GET /api/v1/rooms
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, ToSchema)]
pub struct ListRoomsResponse {
    pub data: Vec<RoomSummary>,
}

#[utoipa::path(
    get,
    path = "/api/v1/rooms",
    tag = "Rooms",
    responses(
        (status = 200, description = "Rooms with at least one member", body = ListRoomsResponse),
    ),
)]
pub async fn list_rooms(State(state): State<AppState>) -> Json<ListRoomsResponse> {
    Json(ListRoomsResponse {
        data: state.hub.rooms(),
    })
}

// ---------------------------------------------------------------------------
// GET /api/v1/rooms/{room_id}/messages
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ListMessagesParams {
    pub after: Option<u64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ListMessagesResponse {
    pub data: Vec<Message>,
    /// Present when messages after `after` were evicted or predate a restart.
    pub gap: Option<Gap>,
}

#[utoipa::path(
    get,
    path = "/api/v1/rooms/{room_id}/messages",
    tag = "Rooms",
    params(
        ("room_id" = String, Path, description = "Room ID"),
        ("after" = Option<u64>, Query, description = "Only messages with a greater sequence"),
    ),
    responses(
        (status = 200, description = "Retained messages, oldest first", body = ListMessagesResponse),
        (status = 400, description = "Invalid room ID", body = ApiErrorBody),
    ),
)]
pub async fn list_messages(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(params): Query<ListMessagesParams>,
) -> Result<Json<ListMessagesResponse>, ApiError> {
    let backfill = state.hub.history(&room_id, params.after)?;
    Ok(Json(ListMessagesResponse {
        data: backfill.messages,
        gap: backfill.gap,
    }))
}

// ---------------------------------------------------------------------------
// POST /api/v1/rooms/{room_id}/messages
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
pub struct SendMessageRequest {
    pub text: String,
}

#[utoipa::path(
    post,
    path = "/api/v1/rooms/{room_id}/messages",
    tag = "Rooms",
    security(("bearer" = [])),
    params(
        ("room_id" = String, Path, description = "Room ID"),
    ),
    request_body = SendMessageRequest,
    responses(
        (status = 201, description = "Message stored and fanned out", body = Message),
        (status = 400, description = "Validation error", body = ApiErrorBody),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
    ),
)]
pub async fn send_message(
    AuthUser(identity): AuthUser,
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Json(body): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<Message>), ApiError> {
    let message = state.hub.publish_as(&identity, &room_id, &body.text)?;
    Ok((StatusCode::CREATED, Json(Message::clone(&message))))
}
