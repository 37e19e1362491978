//! Route handlers, grouped by resource.

pub mod jobs;
pub mod stages;

use axum::Json;
use serde_json::{json, Value};

/// GET /health
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

/// GET /
pub async fn root() -> Json<Value> {
    Json(json!({
        "service": "recap-autopilot",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}
