//! API Module
//!
//! HTTP API layer for the master.
//! Each submodule handles endpoints for a specific domain.

pub mod error;
pub mod execution;
pub mod health;
pub mod job;
pub mod node;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post, put},
};
use tower_http::trace::TraceLayer;

use crate::service::engine::MasterEngine;

/// Create the main API router with all endpoints
pub fn create_router(engine: Arc<MasterEngine>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        .route("/work-root", get(health::work_root))
        // Job definitions
        .route("/jobs", get(job::list_jobs).post(job::create_job))
        .route("/jobs/search", get(job::search_jobs))
        .route(
            "/jobs/{name}",
            get(job::get_job).put(job::update_job).delete(job::delete_job),
        )
        .route("/jobs/{name}/params", put(job::save_job_params))
        // Executions
        .route("/jobs/{name}/history", get(execution::execution_page))
        .route("/jobs/{name}/details", post(execution::create_execution))
        .route(
            "/jobs/{name}/executions",
            get(execution::list_executions).post(execution::execute_job),
        )
        .route(
            "/jobs/{name}/executions/{id}",
            get(execution::get_execution).delete(execution::delete_execution),
        )
        .route(
            "/jobs/{name}/executions/{id}/cancel",
            post(execution::cancel_execution),
        )
        .route(
            "/jobs/{name}/executions/{id}/run",
            post(execution::run_execution),
        )
        .route(
            "/jobs/{name}/executions/{id}/rerun",
            post(execution::rerun_execution),
        )
        .route(
            "/jobs/{name}/executions/{id}/status",
            get(execution::execution_status),
        )
        .route(
            "/jobs/{name}/executions/{id}/logs",
            get(execution::execution_log),
        )
        .route(
            "/jobs/{name}/executions/{id}/logs/{stage}",
            get(execution::stage_log),
        )
        .route(
            "/jobs/{name}/executions/{id}/logs/{stage}/{step}",
            get(execution::step_log),
        )
        // Nodes
        .route("/nodes", get(node::list_nodes))
        // Add state and middleware
        .with_state(engine)
        .layer(TraceLayer::new_for_http())
}
