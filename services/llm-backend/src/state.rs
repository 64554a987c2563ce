use std::sync::Arc;

use llm_runtime::{HealthAggregator, InferenceDispatcher, ModelRuntime};

use crate::config::AppConfig;
use crate::context_store::ContextStore;

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub config: AppConfig,
    pub runtime: Arc<ModelRuntime>,
    pub dispatcher: InferenceDispatcher,
    pub health: HealthAggregator,
    pub contexts: ContextStore,
}

impl AppState {
    pub fn new(config: AppConfig, runtime: Arc<ModelRuntime>) -> Self {
        let contexts = ContextStore::new(config.context_dir(), config.max_context_file_bytes);
        Self {
            dispatcher: InferenceDispatcher::new(runtime.clone()),
            health: HealthAggregator::new(runtime.clone()),
            runtime,
            contexts,
            config,
        }
    }
}
