//! Health Check API Handler

use std::sync::Arc;

use axum::{Json, extract::State};
use serde_json::{Value, json};

use crate::service::engine::MasterEngine;

/// GET /health
/// Liveness plus the number of registered nodes
pub async fn health_check(State(engine): State<Arc<MasterEngine>>) -> Json<Value> {
    Json(json!({ "status": "ok", "nodes": engine.nodes().len() }))
}

/// GET /work-root
/// Directory the master keeps its data in
pub async fn work_root(State(engine): State<Arc<MasterEngine>>) -> Json<Value> {
    Json(json!({ "path": engine.work_root().display().to_string() }))
}
