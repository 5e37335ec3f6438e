//! Node API Handlers

use std::sync::Arc;

use axum::{Json, extract::State};
use tether_core::domain::node::NodeSummary;

use crate::service::engine::MasterEngine;

/// GET /nodes
/// List registered worker nodes
pub async fn list_nodes(State(engine): State<Arc<MasterEngine>>) -> Json<Vec<NodeSummary>> {
    tracing::debug!("Listing nodes");
    Json(engine.nodes())
}
