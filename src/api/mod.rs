//! # HTTP + WebSocket surface.
//!
//! JSON REST under `/api/v1` plus the per-server console WebSocket. The
//! handlers are thin: every operation delegates to the same public
//! contracts the CLI and scheduler use, and every response body is a
//! value-typed snapshot.
//!
//! ## Files & responsibilities
//! - **mod.rs**: application state, router assembly, error → status
//!   mapping, API-key middleware.
//! - **routes.rs**: REST handlers.
//! - **ws.rs**: console WebSocket endpoint speaking the fabric frames.
//!
//! ## Authentication
//! When at least one active API key exists, every mutating route (POST /
//! PATCH / DELETE) requires a valid `X-API-Key: <prefix>.<secret>` header.
//! Reads stay open, matching a single-operator localhost deployment.

mod routes;
mod ws;

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use tracing::{info, warn};

use crate::auth::ApiKeys;
use crate::backup::BackupManager;
use crate::config::Config;
use crate::error::Error;
use crate::lifecycle::Supervisor;
use crate::plugins::PluginManager;
use crate::sched::Scheduler;
use crate::services::ServiceManager;

/// Shared state injected into every handler.
pub struct AppState {
    pub cfg: Config,
    pub supervisor: Arc<Supervisor>,
    pub scheduler: Arc<Scheduler>,
    pub backups: Arc<BackupManager>,
    pub plugins: Arc<PluginManager>,
    pub services: Arc<ServiceManager>,
    pub keys: Arc<ApiKeys>,
    pub started_at: Instant,
}

/// Builds the full application router.
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/servers", get(routes::list_servers).post(routes::create_server))
        .route(
            "/servers/{id}",
            get(routes::get_server)
                .patch(routes::update_server)
                .delete(routes::delete_server),
        )
        .route("/servers/{id}/start", post(routes::start_server))
        .route("/servers/{id}/stop", post(routes::stop_server))
        .route("/servers/{id}/restart", post(routes::restart_server))
        .route("/servers/{id}/status", get(routes::server_status))
        .route("/servers/{id}/command", post(routes::send_command))
        .route(
            "/servers/{id}/backups",
            get(routes::list_backups).post(routes::create_backup),
        )
        .route("/backups/{id}/restore", post(routes::restore_backup))
        .route("/backups/{id}", delete(routes::delete_backup))
        .route(
            "/servers/{id}/plugins",
            get(routes::list_plugins).post(routes::install_plugin),
        )
        .route(
            "/plugins/{id}",
            axum::routing::patch(routes::toggle_plugin).delete(routes::remove_plugin),
        )
        .route(
            "/servers/{id}/schedules",
            get(routes::list_schedules).post(routes::create_schedule),
        )
        .route("/schedules", get(routes::list_all_schedules))
        .route(
            "/schedules/{id}",
            axum::routing::patch(routes::update_schedule).delete(routes::delete_schedule),
        )
        .route(
            "/servers/{id}/properties",
            get(routes::get_properties).patch(routes::update_properties),
        )
        .route("/servers/{id}/service", post(routes::install_service))
        .route("/java", get(routes::list_java).post(routes::install_java))
        .route("/keys", get(routes::list_keys).post(routes::create_key))
        .route("/keys/{id}", delete(routes::revoke_key))
        .route("/servers/{id}/console/ws", get(ws::console_ws))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), require_key));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api)
        .with_state(state)
}

/// Serves the API until the token is cancelled.
pub async fn serve(
    state: Arc<AppState>,
    cancel: tokio_util::sync::CancellationToken,
) -> crate::error::Result<()> {
    let bind = state.cfg.bind;
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|e| Error::Resource(format!("cannot bind {bind}: {e}")))?;
    info!(%bind, "api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::Resource(format!("api server failed: {e}")))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

/// Middleware: mutating routes need a valid key once any key is configured.
async fn require_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let mutating = !matches!(*request.method(), Method::GET | Method::HEAD);
    if mutating {
        let keys_configured = state.keys.any_active().unwrap_or(false);
        if keys_configured {
            let presented = request
                .headers()
                .get("x-api-key")
                .and_then(|v| v.to_str().ok());
            let authorized =
                presented.is_some_and(|token| state.keys.verify(token).is_ok());
            if !authorized {
                warn!(path = %request.uri().path(), "rejected unauthenticated mutation");
                return ApiError(Error::Security("valid X-API-Key required".into()))
                    .into_response();
            }
        }
    }
    next.run(request).await
}

/// Response wrapper mapping the error taxonomy onto HTTP statuses.
pub struct ApiError(pub Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error = self.0;
        let status = if error.is_validation() {
            StatusCode::BAD_REQUEST
        } else if error.is_conflict() {
            StatusCode::CONFLICT
        } else if error.is_security() {
            StatusCode::FORBIDDEN
        } else if matches!(error, Error::NotFound { .. }) {
            StatusCode::NOT_FOUND
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };

        let body = Json(serde_json::json!({
            "error": error.as_label(),
            "message": error.to_string(),
        }));
        (status, body).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        ApiError(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_statuses_follow_the_taxonomy() {
        let cases = [
            (Error::validation("name", "bad"), StatusCode::BAD_REQUEST),
            (
                Error::NameInUse {
                    name: "alpha".into(),
                },
                StatusCode::CONFLICT,
            ),
            (Error::not_found("server", 7), StatusCode::NOT_FOUND),
            (Error::Security("no".into()), StatusCode::FORBIDDEN),
            (
                Error::Resource("disk full".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                Error::DigestMismatch {
                    expected: "aa".into(),
                    actual: "bb".into(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, expected) in cases {
            let response = ApiError(error).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
