use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;
use uuid::Uuid;

use ember_db::models::NewRoom;
use ember_types::api::{
    AddMembersRequest, CreateRoomRequest, DirectRoomRequest, RoomListing, SetInvolvementRequest,
    SharedRoomKind,
};
use ember_types::models::{Membership, Room, RoomKind, User};

use crate::auth::{AppState, AppStateInner, AuthSession};
use crate::error::{ApiError, ApiResult};

pub async fn list_rooms(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthSession>,
) -> ApiResult<Json<Vec<RoomListing>>> {
    let user_id = auth.user.id;
    let rooms = state
        .db
        .read(move |db| db.list_rooms_for_user(user_id))
        .await?
        .into_iter()
        .map(|(room, membership)| RoomListing { room, membership })
        .collect();
    Ok(Json(rooms))
}

pub async fn create_room(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthSession>,
    Json(req): Json<CreateRoomRequest>,
) -> ApiResult<impl IntoResponse> {
    req.validate().map_err(ApiError::Validation)?;

    let kind = match req.kind {
        SharedRoomKind::Open => RoomKind::Open,
        SharedRoomKind::Closed => RoomKind::Closed,
    };
    if kind == RoomKind::Closed {
        require_active_users(&state, &req.member_ids).await?;
    }

    let room = state
        .writer
        .create_room(NewRoom {
            name: req.name.trim().to_string(),
            kind,
            creator_id: auth.user.id,
            member_ids: req.member_ids,
        })
        .await?;

    info!("{} created {} room {}", auth.user.name, kind.as_str(), room.id);
    Ok((StatusCode::CREATED, Json(room)))
}

/// Find or create the direct room for the caller plus `user_ids`.
pub async fn direct_room(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthSession>,
    Json(req): Json<DirectRoomRequest>,
) -> ApiResult<impl IntoResponse> {
    let mut participants = req.user_ids;
    participants.push(auth.user.id);
    participants.sort();
    participants.dedup();

    if participants.len() < 2 {
        return Err(ApiError::Validation(
            "a direct room needs at least one other participant".into(),
        ));
    }
    require_active_users(&state, &participants).await?;

    let (room, created) = state
        .writer
        .find_or_create_direct_room(auth.user.id, participants)
        .await?;

    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(room)))
}

/// Add members to a closed room. Only its creator or an administrator may.
pub async fn add_members(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthSession>,
    Path(room_id): Path<Uuid>,
    Json(req): Json<AddMembersRequest>,
) -> ApiResult<Json<Vec<Membership>>> {
    let room = visible_room(&state, &auth.user, room_id).await?;

    if room.creator_id != auth.user.id && !auth.user.is_admin() {
        return Err(ApiError::Forbidden);
    }
    if room.kind != RoomKind::Closed {
        return Err(ApiError::Validation(
            "members can only be added to closed rooms".into(),
        ));
    }
    require_active_users(&state, &req.user_ids).await?;

    let added = state.writer.add_members(room_id, req.user_ids).await?;
    Ok(Json(added))
}

pub async fn set_involvement(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthSession>,
    Path(room_id): Path<Uuid>,
    Json(req): Json<SetInvolvementRequest>,
) -> ApiResult<Json<Membership>> {
    require_membership(&state, auth.user.id, room_id).await?;
    let membership = state
        .writer
        .set_involvement(auth.user.id, room_id, req.involvement)
        .await?;
    Ok(Json(membership))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthSession>,
    Path(room_id): Path<Uuid>,
) -> ApiResult<Json<Membership>> {
    require_membership(&state, auth.user.id, room_id).await?;
    let membership = state.writer.mark_read(auth.user.id, room_id).await?;
    Ok(Json(membership))
}

/// The caller's membership in a room. A missing room and a room the caller
/// doesn't belong to look the same.
pub(crate) async fn require_membership(
    state: &AppStateInner,
    user_id: Uuid,
    room_id: Uuid,
) -> ApiResult<Membership> {
    state
        .db
        .read(move |db| db.get_membership(user_id, room_id))
        .await?
        .ok_or(ApiError::Forbidden)
}

/// The room, provided the caller may see it: members always, administrators
/// for any room.
async fn visible_room(state: &AppStateInner, caller: &User, room_id: Uuid) -> ApiResult<Room> {
    let user_id = caller.id;
    let (room, membership) = state
        .db
        .read(move |db| Ok((db.get_room(room_id)?, db.get_membership(user_id, room_id)?)))
        .await?;
    let room = room.ok_or(ApiError::Forbidden)?;

    if membership.is_none() && !caller.is_admin() {
        return Err(ApiError::Forbidden);
    }
    Ok(room)
}

async fn require_active_users(state: &AppStateInner, user_ids: &[Uuid]) -> ApiResult<()> {
    let ids = user_ids.to_vec();
    let missing = state
        .db
        .read(move |db| {
            for id in ids {
                if !db.get_user(id)?.is_some_and(|u| u.active) {
                    return Ok(Some(id));
                }
            }
            Ok(None)
        })
        .await?;

    match missing {
        Some(id) => Err(ApiError::Validation(format!("unknown user {id}"))),
        None => Ok(()),
    }
}
