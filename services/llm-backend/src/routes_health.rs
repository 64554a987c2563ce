use axum::{extract::State, Json};
use chrono::Utc;
use llm_runtime::HealthReport;
use serde_json::json;

use crate::state::SharedState;

pub async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "message": "Offline LLM backend",
        "status": "running",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Always 200; a failed probe is reported in the body as `status: "error"`.
pub async fn health(State(state): State<SharedState>) -> Json<HealthReport> {
    Json(state.health.check().await)
}

/// Liveness only; never looks at the model or the host.
pub async fn health_simple() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "message": "Backend is alive",
        "timestamp": Utc::now(),
    }))
}
