use axum::extract::{Multipart, Path, State};
use axum::{http::StatusCode, Json};
use serde_json::json;
use tracing::warn;

use crate::context_store::ContextError;
use crate::routes_generate::ApiError;
use crate::state::SharedState;

fn context_error(e: ContextError) -> ApiError {
    let status = match &e {
        ContextError::InvalidFilename
        | ContextError::UnsupportedType(_)
        | ContextError::MimeMismatch { .. } => StatusCode::BAD_REQUEST,
        ContextError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        ContextError::NotFound(_) => StatusCode::NOT_FOUND,
        ContextError::Io(_) => {
            warn!(error = %e, "context store failure");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({"detail": e.to_string()})))
}

pub async fn upload(
    State(state): State<SharedState>,
    mut mp: Multipart,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut upload: Option<(String, Option<String>, bytes::Bytes)> = None;

    while let Some(field) = mp
        .next_field()
        .await
        .map_err(|e| (e.status(), Json(json!({"detail": e.body_text()}))))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let content_type = field.content_type().map(str::to_string);
        // reject before buffering when the name alone disqualifies the upload
        state
            .contexts
            .check(&filename, content_type.as_deref(), 0)
            .map_err(context_error)?;
        let data = field
            .bytes()
            .await
            .map_err(|e| (e.status(), Json(json!({"detail": e.body_text()}))))?;
        upload = Some((filename, content_type, data));
    }

    let (filename, content_type, data) = upload.ok_or((
        StatusCode::BAD_REQUEST,
        Json(json!({"detail": "Missing file"})),
    ))?;

    let meta = state
        .contexts
        .save(&filename, content_type.as_deref(), &data)
        .await
        .map_err(context_error)?;

    let summary = if meta.text_preview.is_empty() {
        format!("Stored {} ({} bytes).", meta.filename, meta.file_size)
    } else {
        format!(
            "Stored {} ({} bytes, {} words).",
            meta.filename,
            meta.file_size,
            String::from_utf8_lossy(&data).split_whitespace().count()
        )
    };

    Ok(Json(json!({
        "success": true,
        "context_id": meta.context_id,
        "summary": summary,
        "metadata": meta,
    })))
}

pub async fn list(State(state): State<SharedState>) -> Result<Json<serde_json::Value>, ApiError> {
    let files = state.contexts.list().await.map_err(context_error)?;
    Ok(Json(json!({
        "success": true,
        "count": files.len(),
        "files": files,
    })))
}

pub async fn delete(
    State(state): State<SharedState>,
    Path(context_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.contexts.delete(&context_id).await.map_err(context_error)?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Context {context_id} deleted"),
    })))
}
