use axum::{
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::Response,
};

use crate::auth::{AppState, authenticate};
use crate::error::ApiError;

/// Resolve the bearer token and attach the caller as an
/// [`AuthSession`](crate::auth::AuthSession) extension.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(req.headers())
        .ok_or(ApiError::Unauthorized)?
        .to_owned();

    let auth = authenticate(&state, &token).await?;

    req.extensions_mut().insert(auth);
    Ok(next.run(req).await)
}

/// Token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
