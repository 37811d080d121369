use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{middleware, Json, Router};
use relay_store::MessageStore;
use relay_telemetry::{LogFilter, TelemetryHandle};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{self, AdminCredentials};
use crate::config::{ConfigError, ServerConfig};
use crate::connection::Heartbeat;
use crate::identity::SessionIdentity;
use crate::presence::{PresenceCoordinator, PresenceSnapshot};
use crate::service::PresenceService;
use crate::{admin, visitor};

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub presence: PresenceService,
    pub config: Arc<ServerConfig>,
    pub credentials: Arc<AdminCredentials>,
    pub telemetry: TelemetryHandle,
    /// Parent of every connection's close signal.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn heartbeat(&self) -> Heartbeat {
        Heartbeat {
            interval: self.config.heartbeat_interval,
            timeout: self.config.heartbeat_timeout,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let logs_path = format!("{}/logs", state.config.admin_path.trim_end_matches('/'));
    let admin_routes = Router::new()
        .route(&state.config.admin_path, get(admin::ws_handler))
        .route(&logs_path, get(logs_handler))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.credentials),
            auth::require_admin,
        ));

    Router::new()
        .merge(admin_routes)
        .route(&state.config.visitor_path, get(visitor::ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Validate config, spawn the presence actor and serve until shut down.
pub async fn start(
    config: ServerConfig,
    store: Arc<dyn MessageStore>,
    telemetry: TelemetryHandle,
) -> Result<ServerHandle, StartError> {
    config.validate()?;

    let identity = SessionIdentity::new(Arc::clone(&store), config.salt.clone(), config.mint_attempts);
    let coordinator = PresenceCoordinator::new(store, identity);

    let shutdown = CancellationToken::new();
    let (presence, actor) = PresenceService::spawn(coordinator, shutdown.clone());

    let credentials = Arc::new(AdminCredentials::new(
        config.admin_user.clone(),
        config.admin_pass.clone(),
    ));
    let addr = config.bind_addr();
    let state = AppState {
        presence,
        config: Arc::new(config),
        credentials,
        telemetry,
        shutdown: shutdown.clone(),
    };

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| StartError::Bind { addr: addr.clone(), source })?;
    let local_addr = listener
        .local_addr()
        .map_err(|source| StartError::Bind { addr, source })?;

    tracing::info!(port = local_addr.port(), "relay server started");

    let graceful = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { graceful.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        server,
        actor,
    })
}

/// Handle returned by `start()`; keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    actor: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Close every connection, stop the presence actor and the listener.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.actor.await;
        let _ = self.server.await;
        tracing::info!("relay server stopped");
    }
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    #[serde(flatten)]
    presence: PresenceSnapshot,
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.presence.snapshot().await {
        Some(presence) => (
            StatusCode::OK,
            Json(serde_json::to_value(HealthBody { status: "ok", presence }).unwrap_or_default()),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "unavailable" })),
        ),
    }
}

/// Persisted warn+ logs, newest first.
async fn logs_handler(
    State(state): State<AppState>,
    Query(query): Query<LogFilter>,
) -> impl IntoResponse {
    let Some(events) = state.telemetry.events() else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "log persistence is disabled" })),
        );
    };
    match events.recent(&query) {
        Ok(records) => (
            StatusCode::OK,
            Json(serde_json::to_value(records).unwrap_or_default()),
        ),
        Err(e) => {
            tracing::error!(error = %e, "log query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
        }
    }
}
