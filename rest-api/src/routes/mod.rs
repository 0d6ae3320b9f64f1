// Copyright (c) James Kassemi, SC, US. All rights reserved.

pub mod data;
pub mod features;
pub mod ingest;

use crate::state::AppState;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;

/// Assemble the API router.
pub fn api_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(data::routes())
        .merge(ingest::routes())
        .merge(features::routes())
        .with_state(state)
}

async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "ok" }))
}
