use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::SharedState;
use crate::{routes_context, routes_generate, routes_health};

/// Multipart framing overhead allowed on top of the context file limit.
const UPLOAD_SLACK_BYTES: usize = 64 * 1024;

fn routes() -> Router<SharedState> {
    Router::new()
        .route("/", get(routes_health::root))
        .route("/generate", post(routes_generate::generate))
        .route("/generate/status", get(routes_generate::generate_status))
        .route("/health", get(routes_health::health))
        .route("/health/simple", get(routes_health::health_simple))
        .route("/context/upload", post(routes_context::upload))
        .route("/context/list", get(routes_context::list))
        .route("/context/:id", delete(routes_context::delete))
}

/// Every route is reachable both at the root and under `/api`.
pub fn router(state: SharedState) -> Router {
    let body_limit = state.config.max_context_file_bytes as usize + UPLOAD_SLACK_BYTES;

    Router::new()
        .merge(routes())
        .nest("/api", routes())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use llm_runtime::testing::{FixedProbe, RecordingSleeper, ScriptedProvider};
    use llm_runtime::{LifecycleState, ModelProvider, ModelRuntime};
    use serde_json::Value;
    use tempfile::{NamedTempFile, TempDir};
    use tower::ServiceExt;

    use super::*;
    use crate::config::AppConfig;
    use crate::paths::AppPaths;
    use crate::state::AppState;

    struct Harness {
        app: Router,
        state: SharedState,
        _dir: TempDir,
    }

    fn harness(model_path: &std::path::Path, provider: Arc<dyn ModelProvider>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::under(dir.path());
        let model = model_path.display().to_string();
        let mut cfg = AppConfig::from_lookup(&paths, |k| match k {
            "MODEL_PATH" => Some(model.clone()),
            "MAX_CONTEXT_FILE_MB" => Some("1".to_string()),
            _ => None,
        })
        .unwrap();
        cfg.retry_delay = Duration::ZERO;

        let runtime = Arc::new(
            ModelRuntime::new(cfg.runtime_config(), provider)
                .with_probe(Arc::new(FixedProbe::healthy()))
                .with_sleeper(Arc::new(RecordingSleeper::default())),
        );
        let state = Arc::new(AppState::new(cfg, runtime));
        Harness {
            app: router(state.clone()),
            state,
            _dir: dir,
        }
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn multipart(filename: &str, content_type: &str, data: &[u8]) -> Request<Body> {
        let boundary = "XBOUNDARYX";
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/api/context/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn ready_harness() -> (Harness, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let h = harness(file.path(), Arc::new(ScriptedProvider::new().with_reply("4")));
        assert_eq!(h.state.runtime.initialize(1).await, LifecycleState::Ready);
        (h, file)
    }

    #[tokio::test]
    async fn root_and_simple_health() {
        let h = harness(std::path::Path::new("/missing.gguf"), Arc::new(ScriptedProvider::new()));
        let (status, body) = send(&h.app, get_req("/")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "running");

        let (status, body) = send(&h.app, get_req("/api/health/simple")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["message"], "Backend is alive");
        let stamp = body["timestamp"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok(), "{stamp}");
    }

    #[tokio::test]
    async fn empty_prompt_is_422() {
        let (h, _file) = ready_harness().await;
        let (status, body) = send(&h.app, post_json("/generate", serde_json::json!({"prompt": ""}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["detail"].to_string().contains("prompt"));
    }

    #[tokio::test]
    async fn out_of_range_parameters_are_422() {
        let (h, _file) = ready_harness().await;
        let (status, _) = send(
            &h.app,
            post_json("/generate", serde_json::json!({"prompt": "hi", "top_p": 1.5})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, _) = send(&h.app, post_json("/generate", serde_json::json!({"max_tokens": 5}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn ready_model_answers() {
        let (h, _file) = ready_harness().await;
        let (status, body) = send(
            &h.app,
            post_json("/api/generate", serde_json::json!({"prompt": "2+2", "max_tokens": 1000})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["response"], "4");
        assert!(body["metadata"]["tokens_generated"].as_u64().unwrap() >= 1);
        assert_eq!(body["metadata"]["parameters"]["max_tokens"], 512);
        assert!(body["metadata"]["generation_time"].is_number());

        let (status, body) = send(&h.app, get_req("/generate/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");
        assert_eq!(body["details"]["generations_completed"], 1);
    }

    #[tokio::test]
    async fn missing_model_degrades_and_generate_is_503() {
        let h = harness(
            std::path::Path::new("/no/such/model.gguf"),
            Arc::new(ScriptedProvider::new()),
        );
        assert_eq!(h.state.runtime.initialize(3).await, LifecycleState::Degraded);

        let (status, body) = send(&h.app, get_req("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["llm_status"]["state"], "degraded");

        let (status, body) = send(&h.app, post_json("/generate", serde_json::json!({"prompt": "2+2"}))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["model_path"], "/no/such/model.gguf");
        assert!(body["detail"].as_str().unwrap().contains("/no/such/model.gguf"));
        assert_eq!(body["retryable"], false);

        let (status, body) = send(&h.app, get_req("/api/generate/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "not_ready");
    }

    #[tokio::test]
    async fn engine_failure_is_500_and_service_stays_ready() {
        let file = NamedTempFile::new().unwrap();
        let h = harness(file.path(), Arc::new(ScriptedProvider::new().failing_generation()));
        h.state.runtime.initialize(1).await;

        let (status, _) = send(&h.app, post_json("/generate", serde_json::json!({"prompt": "hi"}))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(h.state.runtime.state(), LifecycleState::Ready);
    }

    #[tokio::test]
    async fn context_upload_list_delete() {
        let h = harness(std::path::Path::new("/missing.gguf"), Arc::new(ScriptedProvider::new()));

        let (status, body) = send(&h.app, multipart("notes.txt", "text/plain", b"offline notes")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["metadata"]["filename"], "notes.txt");
        assert_eq!(body["metadata"]["text_preview"], "offline notes");
        let id = body["context_id"].as_str().unwrap().to_string();

        let (status, body) = send(&h.app, get_req("/api/context/list")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);

        let del = Request::builder()
            .method("DELETE")
            .uri(format!("/api/context/{id}"))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&h.app, del).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let del = Request::builder()
            .method("DELETE")
            .uri(format!("/context/{id}"))
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&h.app, del).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn context_upload_rejections() {
        let h = harness(std::path::Path::new("/missing.gguf"), Arc::new(ScriptedProvider::new()));

        let (status, _) = send(&h.app, multipart("..secret.txt", "text/plain", b"x")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&h.app, multipart("photo.png", "image/png", b"x")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let big = vec![b'a'; 1024 * 1024 + 1];
        let (status, _) = send(&h.app, multipart("big.txt", "text/plain", &big)).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }
}
