use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::DispatchError;
use crate::provider::CompletionParams;
use crate::runtime::ModelRuntime;
use crate::types::{
    GenerationMetadata, GenerationParameters, GenerationRequest, GenerationResult, MAX_PROMPT_CHARS,
};

/// Sequences that end one assistant turn.
pub const STOP_SEQUENCES: [&str; 4] = ["</s>", "[INST]", "[/INST]", "\nUser:"];

pub const DEFAULT_SYSTEM_PREAMBLE: &str = "\
You are an AI assistant running entirely offline on this device.
You never use the internet and never send data anywhere; everything stays local.
Answer directly, clearly and concisely, and stay factual.
If asked who you are, say you are a local assistant operating fully offline.
For simple arithmetic, reply with the exact result only.
Do not pad answers with filler or defer the question.";

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationDefaults {
    /// Default when the caller gives none, and the server-side ceiling for any
    /// value the caller does give.
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub repeat_penalty: f32,
    pub queue_timeout: Duration,
    pub system_preamble: String,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.7,
            top_p: 0.9,
            repeat_penalty: 1.1,
            queue_timeout: Duration::from_secs(120),
            system_preamble: DEFAULT_SYSTEM_PREAMBLE.to_string(),
        }
    }
}

impl GenerationDefaults {
    /// Merge caller overrides with the defaults. Out-of-range overrides fall
    /// back to the default; `max_tokens` is always capped at the ceiling.
    pub fn resolve(&self, req: &GenerationRequest) -> GenerationParameters {
        let max_tokens = match req.max_tokens {
            Some(n) if n > 0 => n.min(self.max_tokens),
            _ => self.max_tokens,
        };
        GenerationParameters {
            max_tokens,
            temperature: in_range(req.temperature, 0.0, 2.0).unwrap_or(self.temperature),
            top_p: in_range(req.top_p, 0.0, 1.0).unwrap_or(self.top_p),
            repeat_penalty: in_range(req.repeat_penalty, 0.0, 2.0).unwrap_or(self.repeat_penalty),
        }
    }
}

fn in_range(v: Option<f32>, lo: f32, hi: f32) -> Option<f32> {
    v.filter(|v| *v >= lo && *v <= hi)
}

pub fn compose_prompt(preamble: &str, prompt: &str) -> String {
    format!("{}\n\nUser: {}\nAssistant:", preamble.trim_end(), prompt.trim())
}

/// Turns generation requests into serialized model calls.
#[derive(Clone)]
pub struct InferenceDispatcher {
    runtime: Arc<ModelRuntime>,
}

impl InferenceDispatcher {
    pub fn new(runtime: Arc<ModelRuntime>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Arc<ModelRuntime> {
        &self.runtime
    }

    pub async fn generate(&self, req: GenerationRequest) -> Result<GenerationResult, DispatchError> {
        self.runtime.ensure_ready()?;

        if req.prompt.trim().is_empty() {
            return Err(DispatchError::InvalidRequest("prompt must not be empty".to_string()));
        }
        if req.prompt.chars().count() > MAX_PROMPT_CHARS {
            return Err(DispatchError::InvalidRequest(format!(
                "prompt must contain at most {MAX_PROMPT_CHARS} characters"
            )));
        }

        let defaults = &self.runtime.config().generation;
        let parameters = defaults.resolve(&req);
        let prompt = compose_prompt(&defaults.system_preamble, &req.prompt);
        let params = CompletionParams {
            max_tokens: parameters.max_tokens,
            temperature: parameters.temperature,
            top_p: parameters.top_p,
            repeat_penalty: parameters.repeat_penalty,
            stop: STOP_SEQUENCES.iter().map(|s| s.to_string()).collect(),
        };

        info!(
            prompt_chars = req.prompt.chars().count(),
            max_tokens = parameters.max_tokens,
            "dispatching generation"
        );

        let (completion, elapsed) = match self
            .runtime
            .complete(prompt, params, defaults.queue_timeout)
            .await
        {
            Ok(out) => out,
            Err(e) => {
                warn!(error = %e, "generation failed");
                return Err(e);
            }
        };

        let generation_time = elapsed.as_secs_f64();
        info!(
            generation_time,
            tokens = completion.tokens_generated,
            "generation completed"
        );

        Ok(GenerationResult {
            response: completion.text.trim().to_string(),
            metadata: GenerationMetadata {
                generation_time,
                tokens_generated: completion.tokens_generated,
                model_path: self.runtime.model_path().display().to_string(),
                parameters,
            },
        })
    }
}
