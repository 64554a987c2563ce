//! The one model instance and its lifecycle.
//!
//! Lifecycle state lives in a short-lived `parking_lot::RwLock` that is never
//! held across an `.await`, so status reads return immediately. The model
//! handle lives behind a separate FIFO `tokio::sync::Mutex`; that mutex is the
//! only path into the engine and is what serializes generations.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::dispatcher::GenerationDefaults;
use crate::error::{DispatchError, EngineError, LoadError};
use crate::probe::{ResourceProbe, SysinfoProbe};
use crate::provider::{Completion, CompletionParams, LoadRequest, LoadedModel, ModelProvider, ProviderInfo};
use crate::retry::{RetryDecision, RetryPolicy, Sleeper, TokioSleeper};
use crate::types::{LifecycleState, RuntimeConfigEcho, RuntimeStatus};
use crate::GIB;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub model_path: PathBuf,
    pub context_size: u32,
    pub thread_count: u32,
    /// Advisory only: a shortfall is logged, the load still goes ahead.
    pub min_available_memory_bytes: u64,
    pub retry: RetryPolicy,
    pub generation: GenerationDefaults,
}

impl RuntimeConfig {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            context_size: 4096,
            thread_count: 4,
            min_available_memory_bytes: 6 * GIB,
            retry: RetryPolicy::default(),
            generation: GenerationDefaults::default(),
        }
    }
}

type ModelSlot = Arc<Mutex<Option<Box<dyn LoadedModel>>>>;

struct StatusCell {
    state: LifecycleState,
    last_error: Option<String>,
    last_inference_at: Option<DateTime<Utc>>,
    loaded_at: Option<DateTime<Utc>>,
    retry_count: u32,
    max_retries: u32,
    generations_completed: u64,
    shutdown_requested: bool,
}

pub struct ModelRuntime {
    config: RuntimeConfig,
    provider: Arc<dyn ModelProvider>,
    probe: Arc<dyn ResourceProbe>,
    sleeper: Arc<dyn Sleeper>,
    status: RwLock<StatusCell>,
    model: ModelSlot,
}

impl ModelRuntime {
    pub fn new(config: RuntimeConfig, provider: Arc<dyn ModelProvider>) -> Self {
        let max_retries = config.retry.max_attempts;
        Self {
            config,
            provider,
            probe: Arc::new(SysinfoProbe::new()),
            sleeper: Arc::new(TokioSleeper),
            status: RwLock::new(StatusCell {
                state: LifecycleState::Uninitialized,
                last_error: None,
                last_inference_at: None,
                loaded_at: None,
                retry_count: 0,
                max_retries,
                generations_completed: 0,
                shutdown_requested: false,
            }),
            model: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn model_path(&self) -> &Path {
        &self.config.model_path
    }

    pub fn probe(&self) -> Arc<dyn ResourceProbe> {
        self.probe.clone()
    }

    pub fn provider_info(&self) -> ProviderInfo {
        self.provider.info()
    }

    pub fn state(&self) -> LifecycleState {
        self.status.read().state
    }

    /// Drive the runtime from Uninitialized/Degraded to Ready, retrying
    /// transient failures. Never returns an error: a load that cannot succeed
    /// leaves the runtime Degraded with `last_error` set.
    ///
    /// A call made while another initialization is running is a no-op and
    /// returns `Initializing`.
    pub async fn initialize(&self, max_retries: u32) -> LifecycleState {
        let policy = self.config.retry.with_max_attempts(max_retries.max(1));

        {
            let mut st = self.status.write();
            match st.state {
                LifecycleState::Initializing => {
                    info!("model initialization already in progress; ignoring request");
                    return LifecycleState::Initializing;
                }
                LifecycleState::Ready => {
                    debug!("model already loaded; nothing to initialize");
                    return LifecycleState::Ready;
                }
                LifecycleState::Uninitialized | LifecycleState::Degraded => {}
            }
            st.state = LifecycleState::Initializing;
            st.retry_count = 0;
            st.max_retries = policy.max_attempts;
            st.shutdown_requested = false;
        }

        info!(
            model_path = %self.config.model_path.display(),
            context_size = self.config.context_size,
            threads = self.config.thread_count,
            max_attempts = policy.max_attempts,
            "initializing model"
        );

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.status.write().retry_count = attempt - 1;

            let err = match self.load_once().await {
                Ok(model) => return self.finish_ready(model, attempt).await,
                Err(err) => err,
            };
            self.status.write().last_error = Some(err.to_string());

            match policy.decide(attempt, &err) {
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_secs = delay.as_secs_f64(),
                        error = %err,
                        "model load failed; retrying"
                    );
                    self.sleeper.sleep(delay).await;
                    if self.status.read().shutdown_requested {
                        return self.abandon_initialization();
                    }
                }
                RetryDecision::GiveUp => return self.finish_degraded(err, attempt),
            }
        }
    }

    async fn load_once(&self) -> Result<Box<dyn LoadedModel>, LoadError> {
        let path = self.config.model_path.clone();
        if !path.is_file() {
            return Err(LoadError::ModelNotFound(path));
        }

        self.preflight().await;

        let provider = self.provider.clone();
        let req = LoadRequest {
            model_path: path,
            context_size: self.config.context_size,
            thread_count: self.config.thread_count,
        };
        let started = Instant::now();
        let res = tokio::task::spawn_blocking(move || provider.load(&req))
            .await
            .unwrap_or_else(|e| Err(LoadError::Engine(format!("load task failed: {e}"))));
        debug!(elapsed_secs = started.elapsed().as_secs_f64(), ok = res.is_ok(), "load attempt finished");
        res
    }

    async fn preflight(&self) {
        let probe = self.probe.clone();
        let min = self.config.min_available_memory_bytes;
        match tokio::task::spawn_blocking(move || probe.memory()).await {
            Ok(Ok(mem)) if mem.available_bytes < min => warn!(
                available_gb = gib(mem.available_bytes),
                recommended_gb = gib(min),
                "available memory below recommended minimum; attempting load anyway"
            ),
            Ok(Ok(mem)) => debug!(available_gb = gib(mem.available_bytes), "memory preflight ok"),
            Ok(Err(e)) => warn!(error = %e, "memory preflight unavailable; attempting load anyway"),
            Err(e) => warn!(error = %e, "memory preflight task failed; attempting load anyway"),
        }
    }

    async fn finish_ready(&self, model: Box<dyn LoadedModel>, attempt: u32) -> LifecycleState {
        // Handle goes in before the state flips, so Ready always has a model.
        *self.model.lock().await = Some(model);

        let abandoned = {
            let mut st = self.status.write();
            if st.shutdown_requested {
                st.state = LifecycleState::Uninitialized;
                true
            } else {
                st.state = LifecycleState::Ready;
                st.last_error = None;
                st.retry_count = 0;
                st.loaded_at = Some(Utc::now());
                false
            }
        };

        if abandoned {
            self.release_model().await;
            info!("model finished loading after shutdown was requested; released");
            return LifecycleState::Uninitialized;
        }

        info!(attempt, model_path = %self.config.model_path.display(), "model ready");
        LifecycleState::Ready
    }

    fn finish_degraded(&self, err: LoadError, attempt: u32) -> LifecycleState {
        let mut st = self.status.write();
        if st.shutdown_requested {
            st.state = LifecycleState::Uninitialized;
            return LifecycleState::Uninitialized;
        }
        st.state = LifecycleState::Degraded;
        st.last_error = Some(err.to_string());
        error!(
            attempts = attempt,
            fatal = err.is_fatal(),
            error = %err,
            "model initialization failed; serving in degraded mode"
        );
        LifecycleState::Degraded
    }

    fn abandon_initialization(&self) -> LifecycleState {
        self.status.write().state = LifecycleState::Uninitialized;
        info!("initialization abandoned for shutdown");
        LifecycleState::Uninitialized
    }

    /// Release the model handle and return to Uninitialized. Waits for an
    /// in-flight generation to finish. Safe to call repeatedly or before any
    /// initialization.
    pub async fn cleanup(&self) {
        {
            let mut st = self.status.write();
            if st.state == LifecycleState::Initializing {
                // the load driver lands in Uninitialized when it finishes
                st.shutdown_requested = true;
            } else {
                st.state = LifecycleState::Uninitialized;
                st.loaded_at = None;
            }
        }

        if !self.release_model().await {
            debug!("cleanup: no model loaded");
        }
    }

    async fn release_model(&self) -> bool {
        let model = self.model.lock().await.take();
        match model {
            Some(model) => {
                // native teardown can take a while
                let _ = tokio::task::spawn_blocking(move || drop(model)).await;
                info!("model released");
                true
            }
            None => false,
        }
    }

    /// Non-blocking snapshot; never touches the model lock.
    pub fn status(&self) -> RuntimeStatus {
        let st = self.status.read();
        let g = &self.config.generation;
        let message = match st.state {
            LifecycleState::Initializing => {
                Some("Loading model; this may take several minutes.".to_string())
            }
            LifecycleState::Degraded => Some(
                "Model not loaded. Backend is operational but inference is unavailable."
                    .to_string(),
            ),
            _ => None,
        };

        RuntimeStatus {
            state: st.state,
            ready: st.state == LifecycleState::Ready,
            model_path: self.config.model_path.display().to_string(),
            model_exists: self.config.model_path.is_file(),
            last_error: st.last_error.clone(),
            last_inference_at: st.last_inference_at,
            loaded_at: st.loaded_at,
            retry_count: st.retry_count,
            max_retries: st.max_retries,
            generations_completed: st.generations_completed,
            provider: self.provider.info(),
            config: RuntimeConfigEcho {
                context_size: self.config.context_size,
                thread_count: self.config.thread_count,
                max_tokens: g.max_tokens,
                temperature: g.temperature,
                top_p: g.top_p,
                repeat_penalty: g.repeat_penalty,
            },
            message,
        }
    }

    pub(crate) fn ensure_ready(&self) -> Result<(), DispatchError> {
        let st = self.status.read();
        if st.state == LifecycleState::Ready {
            return Ok(());
        }
        Err(DispatchError::Unavailable {
            state: st.state,
            model_path: self.config.model_path.clone(),
            last_error: st.last_error.clone(),
            retryable: st.state == LifecycleState::Initializing,
        })
    }

    /// The serialized entry point into the model. Callers queue FIFO on the
    /// model lock; a caller still queued after `queue_timeout` gives up without
    /// reaching the engine. Returns the completion and the time spent inside
    /// the engine.
    pub(crate) async fn complete(
        &self,
        prompt: String,
        params: CompletionParams,
        queue_timeout: Duration,
    ) -> Result<(Completion, Duration), DispatchError> {
        let mut guard = tokio::time::timeout(queue_timeout, self.model.clone().lock_owned())
            .await
            .map_err(|_| {
                warn!(timeout_secs = queue_timeout.as_secs_f64(), "generation abandoned while queued");
                DispatchError::QueueTimeout(queue_timeout)
            })?;

        // state may have moved while this call was queued
        self.ensure_ready()?;
        if guard.is_none() {
            return Err(DispatchError::Generation("model handle released".to_string()));
        }

        // The guard moves into the blocking task, so the lock is held until the
        // engine returns even if this future is dropped.
        let started = Instant::now();
        let res = tokio::task::spawn_blocking(move || match guard.as_mut() {
            Some(model) => model.complete(&prompt, &params),
            None => Err(EngineError::new("model handle released")),
        })
        .await
        .map_err(|e| DispatchError::Generation(format!("generation task failed: {e}")))?;
        let elapsed = started.elapsed();

        let completion = res?;
        {
            let mut st = self.status.write();
            st.last_inference_at = Some(Utc::now());
            st.generations_completed += 1;
        }
        Ok((completion, elapsed))
    }
}

fn gib(bytes: u64) -> f64 {
    bytes as f64 / GIB as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FixedProbe, RecordingSleeper, ScriptedProvider};
    use std::sync::atomic::Ordering;
    use tempfile::NamedTempFile;

    fn runtime_for(path: &Path, provider: Arc<ScriptedProvider>) -> (ModelRuntime, Arc<RecordingSleeper>) {
        let sleeper = Arc::new(RecordingSleeper::default());
        let rt = ModelRuntime::new(RuntimeConfig::new(path), provider)
            .with_probe(Arc::new(FixedProbe::healthy()))
            .with_sleeper(sleeper.clone());
        (rt, sleeper)
    }

    #[tokio::test]
    async fn successful_load_reaches_ready() {
        let file = NamedTempFile::new().unwrap();
        let provider = Arc::new(ScriptedProvider::new());
        let (rt, sleeper) = runtime_for(file.path(), provider.clone());

        assert_eq!(rt.state(), LifecycleState::Uninitialized);
        assert_eq!(rt.initialize(3).await, LifecycleState::Ready);

        let status = rt.status();
        assert!(status.ready);
        assert!(status.last_error.is_none());
        assert!(status.loaded_at.is_some());
        assert_eq!(status.retry_count, 0);
        assert_eq!(provider.attempts.load(Ordering::SeqCst), 1);
        assert!(sleeper.slept().is_empty());
    }

    #[tokio::test]
    async fn missing_model_is_fatal_and_not_retried() {
        let provider = Arc::new(ScriptedProvider::new());
        let (rt, sleeper) = runtime_for(Path::new("/definitely/not/here.gguf"), provider.clone());

        assert_eq!(rt.initialize(5).await, LifecycleState::Degraded);

        let status = rt.status();
        assert_eq!(status.state, LifecycleState::Degraded);
        assert!(status.last_error.unwrap().contains("/definitely/not/here.gguf"));
        assert!(!status.model_exists);
        // provider never reached, no backoff taken
        assert_eq!(provider.attempts.load(Ordering::SeqCst), 0);
        assert!(sleeper.slept().is_empty());
    }

    #[tokio::test]
    async fn transient_failures_retry_with_backoff_then_succeed() {
        let file = NamedTempFile::new().unwrap();
        let provider = Arc::new(ScriptedProvider::new().failing_with(vec![
            LoadError::OutOfMemory("ggml_new_object: not enough space".into()),
            LoadError::Engine("mmap failed".into()),
        ]));
        let (rt, sleeper) = runtime_for(file.path(), provider.clone());

        assert_eq!(rt.initialize(3).await, LifecycleState::Ready);
        assert_eq!(provider.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(sleeper.slept(), vec![Duration::from_secs(5), Duration::from_secs(5)]);
        assert!(rt.status().last_error.is_none());
    }

    #[tokio::test]
    async fn exhausted_retries_land_in_degraded() {
        let file = NamedTempFile::new().unwrap();
        let provider = Arc::new(ScriptedProvider::new().failing_with(vec![
            LoadError::Engine("bad magic".into()),
            LoadError::Engine("bad magic".into()),
            LoadError::Engine("bad magic".into()),
        ]));
        let (rt, sleeper) = runtime_for(file.path(), provider.clone());

        assert_eq!(rt.initialize(2).await, LifecycleState::Degraded);
        assert_eq!(provider.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(sleeper.slept().len(), 1);

        let status = rt.status();
        assert_eq!(status.max_retries, 2);
        assert!(status.last_error.unwrap().contains("bad magic"));
        assert!(status.message.is_some());
    }

    #[tokio::test]
    async fn degraded_runtime_can_be_reinitialized() {
        let file = NamedTempFile::new().unwrap();
        let provider = Arc::new(
            ScriptedProvider::new().failing_with(vec![LoadError::Engine("first boot".into())]),
        );
        let (rt, _) = runtime_for(file.path(), provider);

        assert_eq!(rt.initialize(1).await, LifecycleState::Degraded);
        assert_eq!(rt.initialize(1).await, LifecycleState::Ready);
    }

    #[tokio::test]
    async fn low_memory_is_advisory() {
        let file = NamedTempFile::new().unwrap();
        let provider = Arc::new(ScriptedProvider::new());
        let rt = ModelRuntime::new(RuntimeConfig::new(file.path()), provider.clone())
            .with_probe(Arc::new(FixedProbe::with_available_memory(GIB)))
            .with_sleeper(Arc::new(RecordingSleeper::default()));

        assert_eq!(rt.initialize(1).await, LifecycleState::Ready);
        assert_eq!(provider.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let file = NamedTempFile::new().unwrap();
        let (rt, _) = runtime_for(file.path(), Arc::new(ScriptedProvider::new()));

        // never initialized
        rt.cleanup().await;
        assert_eq!(rt.state(), LifecycleState::Uninitialized);

        rt.initialize(1).await;
        rt.cleanup().await;
        rt.cleanup().await;
        assert_eq!(rt.state(), LifecycleState::Uninitialized);
        assert!(rt.model.lock().await.is_none());
    }

    #[tokio::test]
    async fn ready_runtime_ignores_initialize() {
        let file = NamedTempFile::new().unwrap();
        let provider = Arc::new(ScriptedProvider::new());
        let (rt, _) = runtime_for(file.path(), provider.clone());

        rt.initialize(1).await;
        assert_eq!(rt.initialize(1).await, LifecycleState::Ready);
        assert_eq!(provider.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unavailable_error_distinguishes_loading_from_degraded() {
        let (rt, _) = runtime_for(Path::new("/missing.gguf"), Arc::new(ScriptedProvider::new()));

        match rt.ensure_ready() {
            Err(DispatchError::Unavailable { state, retryable, .. }) => {
                assert_eq!(state, LifecycleState::Uninitialized);
                assert!(!retryable);
            }
            other => panic!("unexpected: {other:?}"),
        }

        rt.status.write().state = LifecycleState::Initializing;
        assert!(matches!(
            rt.ensure_ready(),
            Err(DispatchError::Unavailable { retryable: true, .. })
        ));
    }
}
