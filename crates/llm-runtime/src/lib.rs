//! Model lifecycle, serialized inference dispatch and health aggregation for a
//! single locally loaded language model.

pub mod dispatcher;
pub mod error;
pub mod health;
pub mod probe;
pub mod provider;
pub mod reply;
pub mod retry;
pub mod runtime;
pub mod types;

#[cfg(feature = "llama-cpp")]
pub mod llama;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use dispatcher::{GenerationDefaults, InferenceDispatcher, STOP_SEQUENCES};
pub use error::{DispatchError, EngineError, LoadError};
pub use health::{HealthAggregator, HealthReport, HealthStatus, HealthThresholds};
pub use probe::{MemorySnapshot, ResourceProbe, SysinfoProbe, SystemMetrics};
pub use provider::{
    Completion, CompletionParams, LoadRequest, LoadedModel, ModelProvider, ProviderInfo,
    UnavailableProvider,
};
pub use reply::ReplyBuffer;
pub use retry::{Backoff, RetryDecision, RetryPolicy, Sleeper, TokioSleeper};
pub use runtime::{ModelRuntime, RuntimeConfig};
pub use types::*;

/// Bytes in one GiB.
pub const GIB: u64 = 1024 * 1024 * 1024;
