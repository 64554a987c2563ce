//! Bounded teardown: draining HTTP connections, releasing the model and
//! stopping the tokio runtime each get at most the configured grace period.
//!
//! Engine calls run on blocking threads that cannot be cancelled, so the
//! runtime is never dropped normally (that would wait for them); it is shut
//! down with a timeout and any stuck call is abandoned with the process.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use llm_runtime::ModelRuntime;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::sync::Notify;
use tracing::warn;

pub fn build_runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("llm-backend")
        .build()
        .context("Failed to build tokio runtime")
}

/// Serve `app` until `signal` resolves, then wait up to `grace` for open
/// requests to finish before giving up on them.
pub async fn serve_until<F>(listener: TcpListener, app: Router, signal: F, grace: Duration) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let stopping = Arc::new(Notify::new());
    let notify = stopping.clone();
    let server = async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                signal.await;
                notify.notify_one();
            })
            .await
    };

    tokio::select! {
        res = server => res.context("HTTP server failed"),
        _ = async {
            stopping.notified().await;
            tokio::time::sleep(grace).await;
        } => {
            warn!(grace_secs = grace.as_secs_f32(), "open requests did not drain in time; closing them");
            Ok(())
        }
    }
}

/// Release the model and stop `rt`. Returns false when an in-flight engine
/// call outlived the grace period and was abandoned.
pub fn release(rt: Runtime, model: Arc<ModelRuntime>, grace: Duration) -> bool {
    let started = Instant::now();
    let released = rt
        .block_on(tokio::time::timeout(grace, model.cleanup()))
        .is_ok();

    if !released {
        warn!(
            grace_secs = grace.as_secs_f32(),
            "in-flight engine call did not finish in time; abandoning it"
        );
    }

    rt.shutdown_timeout(grace.saturating_sub(started.elapsed()));
    released
}
