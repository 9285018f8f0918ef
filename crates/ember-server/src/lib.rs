pub mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Query, State, WebSocketUpgrade},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use ember_api::auth::{AppState, AppStateInner, authenticate};
use ember_api::cleanup;
use ember_api::error::ApiError;
use ember_api::middleware::bearer_token;
use ember_db::Database;
use ember_db::writer::Writer;
use ember_gateway::dispatcher::Dispatcher;
use ember_gateway::presence::{self, PresenceTracker};
use ember_gateway::registry::RoomRegistry;
use ember_gateway::{Gateway, GatewaySettings, connection};

use crate::config::Config;

const SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

/// Everything a running server shares between requests and sockets.
#[derive(Clone)]
pub struct Services {
    pub app: AppState,
    pub gateway: Arc<Gateway>,
}

impl Services {
    /// Open the store, start the writer and the background loops.
    pub async fn start(config: &Config) -> anyhow::Result<Self> {
        let db = Arc::new(Database::open(&config.db_path)?);

        let registry = Arc::new(RoomRegistry::new());
        let dispatcher = Dispatcher::new(registry.clone());
        let (writer, _writer_task) = Writer::spawn(db.clone(), Arc::new(dispatcher.clone()));

        // No socket survives a restart.
        let reset = writer.reset_connections().await?;
        if reset > 0 {
            info!("Reset {} stale membership connection counters", reset);
        }

        let session_ttl =
            chrono::Duration::from_std(config.session_ttl).context("session TTL out of range")?;

        let presence = Arc::new(PresenceTracker::new());
        let gateway = Arc::new(Gateway {
            registry,
            dispatcher: dispatcher.clone(),
            presence: presence.clone(),
            db: db.clone(),
            writer: writer.clone(),
            settings: GatewaySettings {
                catchup_cap: config.catchup_cap,
                idle_timeout: config.idle_timeout,
                heartbeat_interval: config.heartbeat_interval(),
                auth_timeout: config.auth_timeout,
            },
        });

        let app: AppState = Arc::new(AppStateInner {
            db,
            writer: writer.clone(),
            dispatcher: dispatcher.clone(),
            session_ttl,
        });

        tokio::spawn(presence::run_sweep_loop(
            presence,
            dispatcher,
            config.presence_staleness / 3,
            config.presence_staleness,
        ));
        tokio::spawn(cleanup::run_session_cleanup_loop(
            writer,
            session_ttl,
            SESSION_CLEANUP_INTERVAL,
        ));

        Ok(Self { app, gateway })
    }

    pub fn router(&self) -> Router {
        let ws_route = Router::new()
            .route("/gateway", get(ws_upgrade))
            .with_state(self.clone());

        Router::new()
            .merge(ember_api::router(self.app.clone()))
            .merge(ws_route)
            .route("/health", get(health))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    token: Option<String>,
}

/// Authenticate, then hand the socket to the gateway. Browsers can't set
/// headers on a WebSocket, so `?token=` is accepted alongside the bearer
/// header.
async fn ws_upgrade(
    State(services): State<Services>,
    Query(query): Query<GatewayQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = query
        .token
        .or_else(|| bearer_token(&headers).map(str::to_owned))
    else {
        return ApiError::Unauthorized.into_response();
    };

    let auth_timeout = services.gateway.settings.auth_timeout;
    let auth = match tokio::time::timeout(auth_timeout, authenticate(&services.app, &token)).await
    {
        Ok(Ok(auth)) => auth,
        Ok(Err(e)) => return e.into_response(),
        Err(_) => {
            warn!("Gateway authentication timed out after {:?}", auth_timeout);
            return ApiError::Unauthorized.into_response();
        }
    };

    let gateway = services.gateway.clone();
    ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, gateway, auth.user, auth.session_id)
    })
}
