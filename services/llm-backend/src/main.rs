mod app;
mod config;
mod context_store;
mod paths;
mod routes_context;
mod routes_generate;
mod routes_health;
mod shutdown;
mod state;

use std::sync::Arc;

use anyhow::{Context, Result};
use llm_runtime::{ModelProvider, ModelRuntime};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::paths::AppPaths;
use crate::state::AppState;

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let paths = AppPaths::resolve();
    paths.ensure()?;
    let cfg = AppConfig::from_env(&paths)?;

    info!(
        app_dir = %paths.root.display(),
        data_dir = %cfg.data_dir.display(),
        model_path = %cfg.model_path.display(),
        "starting llm-backend"
    );

    let provider = build_provider(&cfg)?;
    let runtime = Arc::new(ModelRuntime::new(cfg.runtime_config(), provider));

    let rt = shutdown::build_runtime()?;
    let served = rt.block_on(run(cfg.clone(), runtime.clone()));

    info!("shutting down; releasing model");
    shutdown::release(rt, runtime, cfg.shutdown_grace);
    served
}

async fn run(cfg: AppConfig, runtime: Arc<ModelRuntime>) -> Result<()> {
    let app_state = Arc::new(AppState::new(cfg.clone(), runtime.clone()));
    info!(context_dir = %app_state.contexts.dir().display(), "context store ready");

    // Load in the background so health and status answer while the model loads.
    {
        let runtime = runtime.clone();
        let retries = cfg.load_retries;
        tokio::spawn(async move {
            let state = runtime.initialize(retries).await;
            info!(%state, "model initialization finished");
        });
    }

    let app = app::router(app_state);

    let addr = cfg.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("llm-backend listening on http://{addr}");

    shutdown::serve_until(listener, app, shutdown_signal(), cfg.shutdown_grace).await
}

#[cfg(feature = "llama-cpp")]
fn build_provider(cfg: &AppConfig) -> Result<Arc<dyn ModelProvider>> {
    let provider = llm_runtime::llama::LlamaCppProvider::new()?.with_gpu_layers(cfg.gpu_layers);
    Ok(Arc::new(provider))
}

#[cfg(not(feature = "llama-cpp"))]
fn build_provider(_cfg: &AppConfig) -> Result<Arc<dyn ModelProvider>> {
    warn!("built without the `llama-cpp` feature; inference is disabled");
    Ok(Arc::new(llm_runtime::UnavailableProvider))
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable; waiting for Ctrl+C only");
            ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    ctrl_c().await;
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl+C"),
        Err(e) => {
            // without a handler only SIGTERM (or nothing) can stop the server
            warn!(error = %e, "Ctrl+C handler failed");
            std::future::pending::<()>().await;
        }
    }
}
