use std::sync::Arc;

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};
use uuid::Uuid;

use ember_db::Database;
use ember_db::models::NewUser;
use ember_db::writer::{WriteError, Writer};
use ember_gateway::dispatcher::Dispatcher;
use ember_types::api::{AuthResponse, LoginRequest, RegisterRequest};
use ember_types::models::{Role, User};

use crate::error::{ApiError, ApiResult};

/// Sessions are re-stamped at most this often.
const SESSION_TOUCH_INTERVAL_SECS: i64 = 300;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub writer: Writer,
    /// Used to close gateway sockets whose session ends.
    pub dispatcher: Dispatcher,
    /// Idle time after which a session stops working.
    pub session_ttl: Duration,
}

/// The authenticated caller, attached to requests by
/// [`crate::middleware::require_auth`].
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub user: User,
    pub session_id: Uuid,
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<impl IntoResponse> {
    req.validate().map_err(ApiError::Validation)?;

    let password_hash = hash_password(req.password).await?;

    let user = state
        .writer
        .create_user(NewUser {
            name: req.name,
            password_hash: Some(password_hash),
            role: Role::Member,
        })
        .await
        .map_err(|e| match e {
            WriteError::Conflict(_) => ApiError::Conflict("name is taken".into()),
            other => other.into(),
        })?;

    let token = issue_session(&state, user.id).await?;
    info!("Registered {} ({}) as {}", user.name, user.id, user.role.as_str());

    Ok((StatusCode::CREATED, Json(AuthResponse { user, token })))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<impl IntoResponse> {
    let name = req.name.clone();
    let (user, stored_hash) = state
        .db
        .read(move |db| db.get_user_credentials(&name))
        .await?
        .ok_or(ApiError::Unauthorized)?;

    if !user.active {
        return Err(ApiError::Unauthorized);
    }
    // Bots have no password and cannot log in.
    let stored_hash = stored_hash.ok_or(ApiError::Unauthorized)?;

    if !verify_password(req.password, stored_hash).await? {
        warn!("Failed login for {}", user.name);
        return Err(ApiError::Unauthorized);
    }

    let token = issue_session(&state, user.id).await?;
    Ok(Json(AuthResponse { user, token }))
}

pub async fn logout(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthSession>,
) -> ApiResult<StatusCode> {
    state.writer.expire_session(auth.session_id).await?;
    let closed = state.dispatcher.disconnect_session(auth.session_id);
    info!("{} logged out, {} gateway connections closed", auth.user.name, closed);
    Ok(StatusCode::NO_CONTENT)
}

/// Resolve a presented token to its user, enforcing the idle expiry.
pub async fn authenticate(state: &AppStateInner, token: &str) -> ApiResult<AuthSession> {
    let token_hash = hash_token(token);
    let (session, user) = state
        .db
        .read(move |db| db.find_session(&token_hash))
        .await?
        .ok_or(ApiError::Unauthorized)?;

    if !user.active {
        return Err(ApiError::Unauthorized);
    }

    let idle = Utc::now() - session.last_active_at;
    if idle > state.session_ttl {
        if let Err(e) = state.writer.expire_session(session.id).await {
            warn!("Failed to drop expired session {}: {}", session.id, e);
        }
        return Err(ApiError::Unauthorized);
    }

    if idle > Duration::seconds(SESSION_TOUCH_INTERVAL_SECS) {
        if let Err(e) = state.writer.touch_session(session.id).await {
            warn!("Failed to refresh session {}: {}", session.id, e);
        }
    }

    Ok(AuthSession { user, session_id: session.id })
}

async fn issue_session(state: &AppStateInner, user_id: Uuid) -> ApiResult<String> {
    let token = generate_token();
    state.writer.create_session(user_id, hash_token(&token)).await?;
    Ok(token)
}

/// 32 random bytes, URL-safe base64 without padding.
pub fn generate_token() -> String {
    let bytes: [u8; 32] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// What the store keeps instead of the token itself.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

async fn hash_password(password: String) -> ApiResult<String> {
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        ApiError::Internal
    })?
    .map_err(|e| {
        error!("Password hashing failed: {}", e);
        ApiError::Internal
    })
}

async fn verify_password(password: String, stored_hash: String) -> ApiResult<bool> {
    tokio::task::spawn_blocking(move || {
        let parsed = PasswordHash::new(&stored_hash)?;
        Ok::<_, argon2::password_hash::Error>(
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok(),
        )
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        ApiError::Internal
    })?
    .map_err(|e| {
        error!("Stored password hash is unreadable: {}", e);
        ApiError::Internal
    })
}
