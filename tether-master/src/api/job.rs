//! Job API Handlers
//!
//! HTTP endpoints for job definitions.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use tether_core::domain::job::Job;
use tether_core::dto::job::{JobSource, Page, PageQuery, SaveParams};

use crate::api::error::ApiResult;
use crate::service::engine::MasterEngine;

// =============================================================================
// Job Definition Endpoints
// =============================================================================

/// POST /jobs
/// Create a job from its YAML definition
pub async fn create_job(
    State(engine): State<Arc<MasterEngine>>,
    Json(req): Json<JobSource>,
) -> ApiResult<(StatusCode, Json<Job>)> {
    let job = engine.create_job(&req.yaml).await?;
    tracing::info!("Created job: {}", job.name);
    Ok((StatusCode::CREATED, Json(job)))
}

/// GET /jobs
/// List all job definitions
pub async fn list_jobs(State(engine): State<Arc<MasterEngine>>) -> ApiResult<Json<Vec<Job>>> {
    tracing::debug!("Listing jobs");
    Ok(Json(engine.list_jobs().await?))
}

/// GET /jobs/search?keyword=K&page=N&page_size=M
/// Jobs whose name contains the keyword, paged
pub async fn search_jobs(
    State(engine): State<Arc<MasterEngine>>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<Page<Job>>> {
    Ok(Json(
        engine
            .search_jobs(&query.keyword, query.page, query.page_size)
            .await?,
    ))
}

/// GET /jobs/{name}
pub async fn get_job(
    State(engine): State<Arc<MasterEngine>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Job>> {
    Ok(Json(engine.get_job(&name).await?))
}

/// PUT /jobs/{name}
/// Replace a definition; a new name renames the job and its history
pub async fn update_job(
    State(engine): State<Arc<MasterEngine>>,
    Path(name): Path<String>,
    Json(req): Json<JobSource>,
) -> ApiResult<Json<Job>> {
    let job = engine.update_job(&name, &req.yaml).await?;
    tracing::info!("Updated job: {} -> {}", name, job.name);
    Ok(Json(job))
}

/// DELETE /jobs/{name}
/// Delete a job together with its execution history
pub async fn delete_job(
    State(engine): State<Arc<MasterEngine>>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    engine.delete_job(&name).await?;
    tracing::info!("Deleted job: {}", name);
    Ok(StatusCode::NO_CONTENT)
}

/// PUT /jobs/{name}/params
/// Overwrite the job's parameters
pub async fn save_job_params(
    State(engine): State<Arc<MasterEngine>>,
    Path(name): Path<String>,
    Json(req): Json<SaveParams>,
) -> ApiResult<Json<Job>> {
    Ok(Json(engine.save_job_params(&name, req.parameter).await?))
}
