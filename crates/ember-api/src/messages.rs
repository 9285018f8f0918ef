use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use ember_db::models::{CreateOutcome, NewMessage};
use ember_types::api::{EditMessageRequest, SendMessageRequest};
use ember_types::models::Message;

use crate::auth::{AppState, AuthSession};
use crate::error::{ApiError, ApiResult};
use crate::rooms::require_membership;

const DEFAULT_PAGE_SIZE: u32 = 50;
const MAX_PAGE_SIZE: u32 = 200;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    pub limit: Option<u32>,
    /// Page backwards from this message id.
    pub before: Option<Uuid>,
}

/// Post a message. Re-posting a `correlation_id` already used in the room
/// returns the original message with 200 instead of 201, whoever sent it.
pub async fn send_message(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthSession>,
    Path(room_id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    req.validate().map_err(ApiError::Validation)?;
    require_membership(&state, auth.user.id, room_id).await?;

    let outcome = state
        .writer
        .create_message(NewMessage {
            room_id,
            creator_id: auth.user.id,
            body: req.content,
            correlation_id: req.correlation_id,
        })
        .await?;

    match outcome {
        CreateOutcome::Created(message) => Ok((StatusCode::CREATED, Json(message))),
        CreateOutcome::Existing(message) => {
            debug!("Duplicate submission {} in {}", message.correlation_id, room_id);
            Ok((StatusCode::OK, Json(message)))
        }
    }
}

pub async fn get_messages(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthSession>,
    Path(room_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
) -> ApiResult<Json<Vec<Message>>> {
    require_membership(&state, auth.user.id, room_id).await?;

    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let before = query.before;

    let messages = state
        .db
        .read(move |db| db.get_messages(room_id, before, limit))
        .await?;
    Ok(Json(messages))
}

/// Replace a message body. Only its creator or an administrator may.
pub async fn update_message(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthSession>,
    Path((room_id, message_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<EditMessageRequest>,
) -> ApiResult<Json<Message>> {
    req.validate().map_err(ApiError::Validation)?;
    require_membership(&state, auth.user.id, room_id).await?;

    let existing = state
        .db
        .read(move |db| db.get_message(message_id))
        .await?
        .filter(|m| m.room_id == room_id)
        .ok_or(ApiError::NotFound)?;

    if existing.creator_id != auth.user.id && !auth.user.is_admin() {
        return Err(ApiError::Forbidden);
    }

    let message = state.writer.update_message(message_id, req.content).await?;
    Ok(Json(message))
}
