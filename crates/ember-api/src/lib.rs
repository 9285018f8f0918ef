pub mod auth;
pub mod cleanup;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod rooms;
pub mod users;

use axum::{
    Router, middleware as axum_middleware,
    routing::{delete, get, post, put},
};

use crate::auth::AppState;
use crate::middleware::require_auth;

/// REST routes. Everything except register and login requires a session.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/auth/logout", post(auth::logout))
        .route("/rooms", get(rooms::list_rooms).post(rooms::create_room))
        .route("/rooms/direct", post(rooms::direct_room))
        .route("/rooms/{room_id}/members", post(rooms::add_members))
        .route("/rooms/{room_id}/involvement", put(rooms::set_involvement))
        .route("/rooms/{room_id}/read", post(rooms::mark_read))
        .route(
            "/rooms/{room_id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .route(
            "/rooms/{room_id}/messages/{message_id}",
            put(messages::update_message),
        )
        .route("/users/{user_id}", delete(users::deactivate_user))
        .layer(axum_middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state);

    Router::new().merge(public_routes).merge(protected_routes)
}
