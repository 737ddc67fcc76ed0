//! HTTP control surface.
//!
//! Assembles the axum routes for operators and external workers. Every
//! route except `/health` sits behind the optional bearer token. Store work
//! runs on the blocking pool, one session per request.

mod extract;
mod handlers;

use std::future::Future;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;

use crate::error::{Result, RunschedError};
use crate::lifecycle::Controller;
use crate::scheduler::SkipReason;

/// Shared state of every handler.
pub struct AppState {
    pub controller: Controller,
    /// Bearer token required on control routes, if set
    pub auth_token: Option<String>,
}

impl AppState {
    pub fn new(controller: Controller) -> Self {
        let auth_token = controller
            .scheduler()
            .config
            .server
            .auth_token
            .clone()
            .filter(|t| !t.is_empty());
        Self { controller, auth_token }
    }
}

/// Failure payload.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Error half of every handler result.
#[derive(Debug)]
pub enum ApiError {
    Failed(RunschedError),
    /// Benign run-now rejection
    Skipped(SkipReason),
}

impl From<RunschedError> for ApiError {
    fn from(e: RunschedError) -> Self {
        ApiError::Failed(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Failed(e) => {
                let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                if status.is_server_error() {
                    log::error!("Request failed: {}", e);
                }
                (
                    status,
                    ErrorBody {
                        success: false,
                        error: e.to_string(),
                        reason: None,
                    },
                )
            }
            ApiError::Skipped(reason) => {
                let status = match reason {
                    SkipReason::OverCapacity { .. } => StatusCode::TOO_MANY_REQUESTS,
                    _ => StatusCode::CONFLICT,
                };
                (
                    status,
                    ErrorBody {
                        success: false,
                        error: reason.to_string(),
                        reason: Some(reason.code()),
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

/// Build the application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/api/engine/pending", get(handlers::pending_runs))
        .route("/api/engine/sweep", post(handlers::sweep))
        .route("/api/sources", get(handlers::list_sources).post(handlers::add_source))
        .route(
            "/api/sources/{id}",
            get(handlers::show_source)
                .patch(handlers::edit_source)
                .delete(handlers::delete_source),
        )
        .route("/api/sources/{id}/pause", post(handlers::pause_source))
        .route("/api/sources/{id}/resume", post(handlers::resume_source))
        .route("/api/sources/{id}/stop", post(handlers::stop_source))
        .route("/api/sources/{id}/run", post(handlers::run_source))
        .route("/api/sources/{id}/runs", get(handlers::list_runs))
        .route("/api/runs/{id}/reconcile", post(handlers::reconcile_run))
        .route("/api/runs/{id}/logs", get(handlers::job_logs).post(handlers::append_job_log))
        .route("/api/runs/{id}/claim", post(handlers::claim_run))
        .route("/api/runs/{id}/progress", post(handlers::report_progress))
        .route("/api/runs/{id}/outputs", post(handlers::record_output))
        .route("/api/runs/{id}/exit", post(handlers::report_exit))
        .route("/api/runs/{id}/pause", post(handlers::pause_run))
        .route("/api/runs/{id}/resume", post(handlers::resume_run))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(api)
        .with_state(state)
}

async fn require_token(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    if let Some(expected) = &state.auth_token {
        let presented = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented != Some(expected.as_str()) {
            return ApiError::Failed(RunschedError::Unauthorized).into_response();
        }
    }
    next.run(request).await
}

/// Serve the control surface until `shutdown` resolves.
pub async fn serve<F>(state: Arc<AppState>, bind: &str, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(bind).await?;
    log::info!("Control surface listening on {}", listener.local_addr()?);
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
