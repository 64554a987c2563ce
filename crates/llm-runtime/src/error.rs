use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::types::LifecycleState;

/// Outcome of a failed load attempt.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    #[error("Model file not found: {}", .0.display())]
    ModelNotFound(PathBuf),

    #[error("No inference backend available: {0}")]
    Unsupported(String),

    #[error("Out of memory while loading model: {0}")]
    OutOfMemory(String),

    #[error("Model load failed: {0}")]
    Engine(String),
}

impl LoadError {
    /// Fatal errors will not resolve on a later attempt without operator action.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LoadError::ModelNotFound(_) | LoadError::Unsupported(_))
    }
}

/// Failure inside a single call into a loaded model.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("LLM model not loaded (state: {state}). Model file expected at: {}", model_path.display())]
    Unavailable {
        state: LifecycleState,
        model_path: PathBuf,
        last_error: Option<String>,
        /// True while the model is still loading; callers may come back later.
        retryable: bool,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request waited {0:?} for the model and was abandoned")]
    QueueTimeout(Duration),

    #[error("Generation failed: {0}")]
    Generation(String),
}

impl From<EngineError> for DispatchError {
    fn from(e: EngineError) -> Self {
        DispatchError::Generation(e.0)
    }
}
