use axum::{
    Extension, Json,
    extract::{Path, State},
};
use tracing::info;
use uuid::Uuid;

use ember_types::models::User;

use crate::auth::{AppState, AuthSession};
use crate::error::{ApiError, ApiResult};

/// Deactivate an account, end its sessions and close its sockets.
/// Administrators only.
pub async fn deactivate_user(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthSession>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<User>> {
    if !auth.user.is_admin() {
        return Err(ApiError::Forbidden);
    }
    if user_id == auth.user.id {
        return Err(ApiError::Validation("cannot deactivate yourself".into()));
    }

    let user = state.writer.deactivate_user(user_id).await?;
    let closed = state.dispatcher.disconnect_user(user.id);
    info!(
        "{} deactivated {} ({}), {} gateway connections closed",
        auth.user.name, user.name, user.id, closed
    );
    Ok(Json(user))
}
