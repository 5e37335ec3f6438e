//! Execution API Handlers
//!
//! HTTP endpoints for running jobs, their history and their logs.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde_json::{Value, json};
use tether_core::domain::detail::JobDetail;
use tether_core::domain::log::{StageLog, StepLog};
use tether_core::dto::job::{Page, PageQuery, StageLogQuery};

use crate::api::error::ApiResult;
use crate::service::engine::MasterEngine;

// =============================================================================
// Execution Lifecycle Endpoints
// =============================================================================

/// POST /jobs/{name}/executions
/// Create an execution and dispatch it to a worker
pub async fn execute_job(
    State(engine): State<Arc<MasterEngine>>,
    Path(name): Path<String>,
) -> ApiResult<(StatusCode, Json<JobDetail>)> {
    tracing::info!("Executing job: {}", name);
    let detail = engine.execute_job(&name).await?;
    Ok((StatusCode::ACCEPTED, Json(detail)))
}

/// GET /jobs/{name}/executions
/// Execution history, newest first
pub async fn list_executions(
    State(engine): State<Arc<MasterEngine>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Vec<JobDetail>>> {
    Ok(Json(engine.job_history(&name).await?))
}

/// GET /jobs/{name}/history?page=N&page_size=M
/// One page of the execution history
pub async fn execution_page(
    State(engine): State<Arc<MasterEngine>>,
    Path(name): Path<String>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<Page<JobDetail>>> {
    Ok(Json(
        engine
            .job_history_page(&name, query.page, query.page_size)
            .await?,
    ))
}

/// POST /jobs/{name}/details
/// Create an execution without dispatching it
pub async fn create_execution(
    State(engine): State<Arc<MasterEngine>>,
    Path(name): Path<String>,
) -> ApiResult<(StatusCode, Json<JobDetail>)> {
    let detail = engine.create_job_detail(&name).await?;
    Ok((StatusCode::CREATED, Json(detail)))
}

/// POST /jobs/{name}/executions/{id}/run
/// Dispatch a created execution
pub async fn run_execution(
    State(engine): State<Arc<MasterEngine>>,
    Path((name, id)): Path<(String, u64)>,
) -> ApiResult<(StatusCode, Json<JobDetail>)> {
    tracing::info!("Running execution: {}/{}", name, id);
    let detail = engine.execute_job_detail(&name, id).await?;
    Ok((StatusCode::ACCEPTED, Json(detail)))
}

/// POST /jobs/{name}/executions/{id}/rerun
/// Retry a finished execution as a new one
pub async fn rerun_execution(
    State(engine): State<Arc<MasterEngine>>,
    Path((name, id)): Path<(String, u64)>,
) -> ApiResult<(StatusCode, Json<JobDetail>)> {
    tracing::info!("Re-running execution: {}/{}", name, id);
    let detail = engine.re_execute_job(&name, id).await?;
    Ok((StatusCode::ACCEPTED, Json(detail)))
}

/// GET /jobs/{name}/executions/{id}
pub async fn get_execution(
    State(engine): State<Arc<MasterEngine>>,
    Path((name, id)): Path<(String, u64)>,
) -> ApiResult<Json<JobDetail>> {
    Ok(Json(engine.get_job_detail(&name, id).await?))
}

/// DELETE /jobs/{name}/executions/{id}
pub async fn delete_execution(
    State(engine): State<Arc<MasterEngine>>,
    Path((name, id)): Path<(String, u64)>,
) -> ApiResult<StatusCode> {
    engine.delete_job_detail(&name, id).await?;
    tracing::info!("Deleted execution: {}/{}", name, id);
    Ok(StatusCode::NO_CONTENT)
}

/// POST /jobs/{name}/executions/{id}/cancel
pub async fn cancel_execution(
    State(engine): State<Arc<MasterEngine>>,
    Path((name, id)): Path<(String, u64)>,
) -> ApiResult<Json<JobDetail>> {
    tracing::info!("Cancelling execution: {}/{}", name, id);
    Ok(Json(engine.cancel_job(&name, id).await?))
}

/// GET /jobs/{name}/executions/{id}/status
/// Live status, asked of the executing worker while not terminal
pub async fn execution_status(
    State(engine): State<Arc<MasterEngine>>,
    Path((name, id)): Path<(String, u64)>,
) -> ApiResult<Json<Value>> {
    let status = engine.job_status(&name, id).await?;
    Ok(Json(json!({ "job_name": name, "job_id": id, "status": status })))
}

// =============================================================================
// Log Endpoints
// =============================================================================

/// GET /jobs/{name}/executions/{id}/logs
/// Full log text
pub async fn execution_log(
    State(engine): State<Arc<MasterEngine>>,
    Path((name, id)): Path<(String, u64)>,
) -> ApiResult<String> {
    engine.job_log(&name, id).await.map_err(Into::into)
}

/// GET /jobs/{name}/executions/{id}/logs/{stage}?start=N
/// One stage's lines from `start`, for tailing
pub async fn stage_log(
    State(engine): State<Arc<MasterEngine>>,
    Path((name, id, stage)): Path<(String, u64, String)>,
    Query(query): Query<StageLogQuery>,
) -> ApiResult<Json<StageLog>> {
    Ok(Json(
        engine.job_stage_log(&name, id, &stage, query.start).await?,
    ))
}

/// GET /jobs/{name}/executions/{id}/logs/{stage}/{step}
pub async fn step_log(
    State(engine): State<Arc<MasterEngine>>,
    Path((name, id, stage, step)): Path<(String, u64, String, String)>,
) -> ApiResult<Json<StepLog>> {
    Ok(Json(engine.job_step_log(&name, id, &stage, &step).await?))
}
