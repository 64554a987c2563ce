//! GGUF inference through llama.cpp (`llama-cpp-2` bindings).
//!
//! The backend is initialized once per process and shared by every model the
//! provider loads. Each completion builds a fresh context over the loaded
//! weights, so no KV cache survives between requests.

use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use tracing::{debug, info};

use crate::error::{EngineError, LoadError};
use crate::provider::{Completion, CompletionParams, LoadRequest, LoadedModel, ModelProvider, ProviderInfo};
use crate::reply::ReplyBuffer;

/// Tokens considered by the repetition penalty.
const PENALTY_LAST_N: i32 = 64;

pub struct LlamaCppProvider {
    backend: Arc<LlamaBackend>,
    gpu_layers: u32,
}

impl LlamaCppProvider {
    /// Fails if llama.cpp was already initialized elsewhere in this process.
    pub fn new() -> anyhow::Result<Self> {
        let backend = LlamaBackend::init()
            .map_err(|e| anyhow::anyhow!("failed to initialize llama.cpp backend: {e}"))?;
        Ok(Self {
            backend: Arc::new(backend),
            gpu_layers: 0,
        })
    }

    pub fn with_gpu_layers(mut self, layers: u32) -> Self {
        self.gpu_layers = layers;
        self
    }
}

impl ModelProvider for LlamaCppProvider {
    fn load(&self, req: &LoadRequest) -> Result<Box<dyn LoadedModel>, LoadError> {
        if !req.model_path.is_file() {
            return Err(LoadError::ModelNotFound(req.model_path.clone()));
        }
        let params = LlamaModelParams::default().with_n_gpu_layers(self.gpu_layers);
        let model = LlamaModel::load_from_file(&self.backend, &req.model_path, &params)
            .map_err(|e| classify_load_error(&req.model_path, e.to_string()))?;

        info!(
            model_path = %req.model_path.display(),
            context_size = req.context_size,
            threads = req.thread_count,
            gpu_layers = self.gpu_layers,
            "llama.cpp model loaded"
        );

        Ok(Box::new(LlamaCppModel {
            backend: self.backend.clone(),
            model,
            context_size: req.context_size,
            thread_count: req.thread_count,
        }))
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "llama.cpp".to_string(),
            detail: format!("gguf, {} gpu layers", self.gpu_layers),
        }
    }
}

fn classify_load_error(path: &Path, msg: String) -> LoadError {
    let lower = msg.to_lowercase();
    if lower.contains("out of memory") || lower.contains("alloc") || lower.contains("not enough space") {
        return LoadError::OutOfMemory(msg);
    }
    LoadError::Engine(format!("{}: {msg}", path.display()))
}

struct LlamaCppModel {
    backend: Arc<LlamaBackend>,
    model: LlamaModel,
    context_size: u32,
    thread_count: u32,
}

// SAFETY: the model is only reached through `&mut self` while the runtime
// holds its model lock, so at most one thread touches it at a time.
unsafe impl Send for LlamaCppModel {}

impl LoadedModel for LlamaCppModel {
    fn complete(&mut self, prompt: &str, params: &CompletionParams) -> Result<Completion, EngineError> {
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(self.context_size))
            .with_n_threads(self.thread_count as i32)
            .with_n_threads_batch(self.thread_count as i32);
        let mut ctx = self
            .model
            .new_context(&self.backend, ctx_params)
            .map_err(|e| EngineError::new(format!("failed to create context: {e}")))?;

        let tokens = self
            .model
            .str_to_token(prompt, AddBos::Always)
            .map_err(|e| EngineError::new(format!("tokenization failed: {e}")))?;
        if tokens.is_empty() {
            return Err(EngineError::new("prompt produced no tokens"));
        }
        let budget = self.context_size as usize;
        if tokens.len() >= budget {
            return Err(EngineError::new(format!(
                "prompt is {} tokens, context holds {budget}",
                tokens.len()
            )));
        }

        let mut batch = LlamaBatch::new(budget, 1);
        let last = tokens.len() - 1;
        for (i, token) in tokens.iter().enumerate() {
            batch
                .add(*token, i as i32, &[0], i == last)
                .map_err(|e| EngineError::new(format!("batch add failed: {e}")))?;
        }
        ctx.decode(&mut batch)
            .map_err(|e| EngineError::new(format!("prompt decode failed: {e}")))?;

        let mut sampler = sampler_for(params);
        let mut reply = ReplyBuffer::new();
        let mut stopped = None;
        let mut produced = 0u32;
        let mut pos = tokens.len();

        while produced < params.max_tokens && pos < budget {
            let token = sampler.sample(&ctx, batch.n_tokens() - 1);
            sampler.accept(token);
            if self.model.is_eog_token(token) {
                break;
            }

            // a piece may hold only part of a UTF-8 character
            let piece = self
                .model
                .token_to_bytes(token, Special::Tokenize)
                .map_err(|e| EngineError::new(format!("detokenize failed: {e}")))?;
            reply.push(&piece);
            produced += 1;

            if let Some(text) = reply.stopped_text(&params.stop) {
                stopped = Some(text);
                break;
            }

            batch.clear();
            batch
                .add(token, pos as i32, &[0], true)
                .map_err(|e| EngineError::new(format!("batch add failed: {e}")))?;
            pos += 1;
            ctx.decode(&mut batch)
                .map_err(|e| EngineError::new(format!("decode failed: {e}")))?;
        }

        debug!(tokens = produced, "llama.cpp completion finished");
        Ok(Completion {
            text: stopped.unwrap_or_else(|| reply.into_text()),
            tokens_generated: produced,
        })
    }
}

fn sampler_for(params: &CompletionParams) -> LlamaSampler {
    let penalties = LlamaSampler::penalties(PENALTY_LAST_N, params.repeat_penalty, 0.0, 0.0);
    if params.temperature <= 0.0 {
        return LlamaSampler::chain_simple([penalties, LlamaSampler::greedy()]);
    }
    LlamaSampler::chain_simple([
        penalties,
        LlamaSampler::top_p(params.top_p, 1),
        LlamaSampler::temp(params.temperature),
        LlamaSampler::dist(rand_seed()),
    ])
}

fn rand_seed() -> u32 {
    chrono::Utc::now().timestamp_subsec_nanos()
}
