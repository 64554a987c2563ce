use axum::extract::rejection::JsonRejection;
use axum::{extract::State, http::StatusCode, Json};
use llm_runtime::{DispatchError, GenerationRequest, GenerationResult, LifecycleState};
use serde_json::json;

use crate::state::SharedState;

pub type ApiError = (StatusCode, Json<serde_json::Value>);

pub async fn generate(
    State(state): State<SharedState>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Json<GenerationResult>, ApiError> {
    let Json(req) = payload.map_err(|e| (e.status(), Json(json!({"detail": e.body_text()}))))?;

    req.validate()
        .map_err(|errs| (StatusCode::UNPROCESSABLE_ENTITY, Json(json!({"detail": errs}))))?;

    let res = state.dispatcher.generate(req).await.map_err(dispatch_error)?;
    Ok(Json(res))
}

pub fn dispatch_error(e: DispatchError) -> ApiError {
    let detail = e.to_string();
    match e {
        DispatchError::Unavailable {
            state,
            model_path,
            last_error,
            retryable,
        } => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "detail": detail,
                "state": state,
                "model_path": model_path.display().to_string(),
                "retryable": retryable,
                "last_error": last_error,
            })),
        ),
        DispatchError::InvalidRequest(_) => {
            (StatusCode::UNPROCESSABLE_ENTITY, Json(json!({"detail": detail})))
        }
        DispatchError::QueueTimeout(_) => (StatusCode::GATEWAY_TIMEOUT, Json(json!({"detail": detail}))),
        DispatchError::Generation(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"detail": detail})))
        }
    }
}

pub async fn generate_status(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let details = state.runtime.status();
    let status = match details.state {
        LifecycleState::Ready => "ready",
        LifecycleState::Initializing => "loading",
        LifecycleState::Uninitialized | LifecycleState::Degraded => "not_ready",
    };
    Json(json!({
        "status": status,
        "details": details,
    }))
}
