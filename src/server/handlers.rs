//! Axum handler functions.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{Result, RunschedError};
use crate::lifecycle::{AddSource, Controller, EditSource, RunNow};
use crate::scheduler::{DispatchOutcome, SweepOptions};
use crate::server::extract::{ApiJson, ApiPath, ApiQuery};
use crate::server::{ApiError, AppState};
use crate::store::{Counters, NewJobLog, NewOutput};

type ApiResult<T> = std::result::Result<T, ApiError>;

const DEFAULT_LOG_LIMIT: usize = 100;
const DEFAULT_RUN_LIMIT: usize = 20;

/// Run a controller call on the blocking pool.
async fn blocking<T, F>(state: &AppState, f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&Controller) -> Result<T> + Send + 'static,
{
    let controller = state.controller.clone();
    let result = tokio::task::spawn_blocking(move || f(&controller))
        .await
        .map_err(RunschedError::from)?;
    Ok(result?)
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SweepParams {
    #[serde(default)]
    pub backfill: bool,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteParams {
    #[serde(default)]
    pub delete_outputs: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ForceParams {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExitBody {
    pub code: Option<i32>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub mode: &'static str,
}

// ── Engine ────────────────────────────────────────────────────────

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        mode: state.controller.scheduler().executor.mode().as_str(),
    })
}

pub async fn pending_runs(
    State(state): State<Arc<AppState>>,
    ApiQuery(params): ApiQuery<LimitParams>,
) -> ApiResult<impl IntoResponse> {
    let limit = params
        .limit
        .unwrap_or(state.controller.scheduler().config.runner.pending_limit);
    let pending = blocking(&state, move |c| c.pending_runs(limit)).await?;
    Ok(Json(json!({ "pending": pending })))
}

pub async fn sweep(
    State(state): State<Arc<AppState>>,
    ApiQuery(params): ApiQuery<SweepParams>,
) -> ApiResult<impl IntoResponse> {
    let options = SweepOptions {
        backfill: params.backfill,
        force: params.force,
        now: None,
    };
    let report = state.controller.scheduler().sweep(options).await?;
    Ok(Json(json!({ "success": true, "report": report })))
}

// ── Sources ───────────────────────────────────────────────────────

pub async fn list_sources(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let sources = blocking(&state, |c| c.list_sources()).await?;
    Ok(Json(json!({ "sources": sources })))
}

pub async fn add_source(
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<AddSource>,
) -> ApiResult<impl IntoResponse> {
    let (source, created) = blocking(&state, move |c| c.add_source(&body)).await?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(json!({ "success": true, "created": created, "source": source }))))
}

pub async fn show_source(State(state): State<Arc<AppState>>, ApiPath(id): ApiPath<i64>) -> ApiResult<impl IntoResponse> {
    let detail = blocking(&state, move |c| c.show_source(id)).await?;
    Ok(Json(detail))
}

pub async fn edit_source(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<i64>,
    ApiJson(body): ApiJson<EditSource>,
) -> ApiResult<impl IntoResponse> {
    let source = blocking(&state, move |c| c.edit(id, &body)).await?;
    Ok(Json(json!({ "success": true, "source": source })))
}

pub async fn delete_source(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<i64>,
    ApiQuery(params): ApiQuery<DeleteParams>,
) -> ApiResult<impl IntoResponse> {
    blocking(&state, move |c| c.delete(id, params.delete_outputs)).await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn pause_source(State(state): State<Arc<AppState>>, ApiPath(id): ApiPath<i64>) -> ApiResult<impl IntoResponse> {
    let source = blocking(&state, move |c| c.pause(id)).await?;
    Ok(Json(json!({ "success": true, "source": source })))
}

pub async fn resume_source(State(state): State<Arc<AppState>>, ApiPath(id): ApiPath<i64>) -> ApiResult<impl IntoResponse> {
    let source = blocking(&state, move |c| c.resume(id)).await?;
    Ok(Json(json!({ "success": true, "source": source })))
}

pub async fn stop_source(State(state): State<Arc<AppState>>, ApiPath(id): ApiPath<i64>) -> ApiResult<impl IntoResponse> {
    let report = blocking(&state, move |c| c.stop(id)).await?;
    Ok(Json(json!({ "success": true, "stop": report })))
}

/// Run-now; benign skips answer 409, capacity 429.
pub async fn run_source(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<i64>,
    ApiQuery(params): ApiQuery<RunNow>,
) -> ApiResult<impl IntoResponse> {
    match blocking(&state, move |c| c.run_now(id, &params)).await? {
        DispatchOutcome::Started(run) => Ok((StatusCode::CREATED, Json(json!({ "success": true, "run": run })))),
        DispatchOutcome::Skipped(reason) => Err(ApiError::Skipped(reason)),
    }
}

pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<i64>,
    ApiQuery(params): ApiQuery<LimitParams>,
) -> ApiResult<impl IntoResponse> {
    let limit = params.limit.unwrap_or(DEFAULT_RUN_LIMIT);
    let runs = blocking(&state, move |c| c.list_runs(id, limit)).await?;
    Ok(Json(json!({ "runs": runs })))
}

// ── Runs ──────────────────────────────────────────────────────────

pub async fn reconcile_run(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<i64>,
    ApiQuery(params): ApiQuery<ForceParams>,
) -> ApiResult<impl IntoResponse> {
    let report = blocking(&state, move |c| c.reconcile(id, params.force)).await?;
    Ok(Json(json!({ "success": true, "reconcile": report })))
}

pub async fn job_logs(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<i64>,
    ApiQuery(params): ApiQuery<LimitParams>,
) -> ApiResult<impl IntoResponse> {
    let limit = params.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    let logs = blocking(&state, move |c| c.job_logs(id, limit)).await?;
    Ok(Json(json!({ "logs": logs })))
}

pub async fn append_job_log(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<i64>,
    ApiJson(body): ApiJson<NewJobLog>,
) -> ApiResult<impl IntoResponse> {
    let entry = blocking(&state, move |c| c.append_job_log(id, &body)).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

pub async fn claim_run(State(state): State<Arc<AppState>>, ApiPath(id): ApiPath<i64>) -> ApiResult<impl IntoResponse> {
    if blocking(&state, move |c| c.claim_run(id)).await? {
        Ok(Json(json!({ "success": true, "run_id": id })))
    } else {
        Err(RunschedError::InvalidState(format!("run {} is not pending", id)).into())
    }
}

pub async fn report_progress(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<i64>,
    ApiJson(body): ApiJson<Counters>,
) -> ApiResult<impl IntoResponse> {
    let counters = blocking(&state, move |c| c.report_progress(id, &body)).await?;
    Ok(Json(json!({ "success": true, "counters": counters })))
}

pub async fn record_output(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<i64>,
    ApiJson(body): ApiJson<NewOutput>,
) -> ApiResult<impl IntoResponse> {
    let output = blocking(&state, move |c| c.record_output(id, &body)).await?;
    Ok((StatusCode::CREATED, Json(output)))
}

pub async fn report_exit(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<i64>,
    ApiJson(body): ApiJson<ExitBody>,
) -> ApiResult<impl IntoResponse> {
    let run = blocking(&state, move |c| c.report_exit(id, body.code)).await?;
    Ok(Json(json!({ "success": true, "run": run })))
}

pub async fn pause_run(State(state): State<Arc<AppState>>, ApiPath(id): ApiPath<i64>) -> ApiResult<impl IntoResponse> {
    let run = blocking(&state, move |c| c.pause_run(id)).await?;
    Ok(Json(json!({ "success": true, "run": run })))
}

pub async fn resume_run(State(state): State<Arc<AppState>>, ApiPath(id): ApiPath<i64>) -> ApiResult<impl IntoResponse> {
    let run = blocking(&state, move |c| c.resume_run(id)).await?;
    Ok(Json(json!({ "success": true, "run": run })))
}
