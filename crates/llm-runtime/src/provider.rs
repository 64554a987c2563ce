use std::path::PathBuf;

use crate::error::{EngineError, LoadError};

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProviderInfo {
    pub name: String,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub model_path: PathBuf,
    pub context_size: u32,
    pub thread_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub repeat_penalty: f32,
    pub stop: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub tokens_generated: u32,
}

/// Loads model handles. `load` blocks for as long as the native engine needs
/// and is only ever called from the blocking thread pool.
pub trait ModelProvider: Send + Sync {
    fn load(&self, req: &LoadRequest) -> Result<Box<dyn LoadedModel>, LoadError>;
    fn info(&self) -> ProviderInfo;
}

/// A loaded model. Not safe for concurrent use, hence `&mut self`.
pub trait LoadedModel: Send {
    fn complete(&mut self, prompt: &str, params: &CompletionParams)
        -> Result<Completion, EngineError>;
}

/// Stand-in used when the binary is built without a native backend.
/// Every load fails fatally so the service comes up degraded.
#[derive(Debug, Default, Clone)]
pub struct UnavailableProvider;

impl ModelProvider for UnavailableProvider {
    fn load(&self, req: &LoadRequest) -> Result<Box<dyn LoadedModel>, LoadError> {
        if !req.model_path.exists() {
            return Err(LoadError::ModelNotFound(req.model_path.clone()));
        }
        Err(LoadError::Unsupported(
            "built without the `llama-cpp` feature".to_string(),
        ))
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "unavailable".to_string(),
            detail: "no inference backend compiled in".to_string(),
        }
    }
}
