use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::provider::ProviderInfo;

/// Longest prompt accepted from a caller, in characters.
pub const MAX_PROMPT_CHARS: usize = 2000;
/// Largest `max_tokens` a caller may ask for. The server-side ceiling may be lower.
pub const MAX_TOKENS_LIMIT: u32 = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Uninitialized,
    Initializing,
    Ready,
    Degraded,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Initializing => "initializing",
            LifecycleState::Ready => "ready",
            LifecycleState::Degraded => "degraded",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub repeat_penalty: Option<f32>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Schema-level checks applied at the edge before a request is dispatched.
    /// Returns every violation found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let chars = self.prompt.chars().count();
        if chars == 0 {
            errors.push("prompt: must contain at least 1 character".to_string());
        } else if chars > MAX_PROMPT_CHARS {
            errors.push(format!("prompt: must contain at most {MAX_PROMPT_CHARS} characters"));
        }
        if let Some(n) = self.max_tokens {
            if !(1..=MAX_TOKENS_LIMIT).contains(&n) {
                errors.push(format!("max_tokens: must be between 1 and {MAX_TOKENS_LIMIT}"));
            }
        }
        check_range(&mut errors, "temperature", self.temperature, 0.0, 2.0);
        check_range(&mut errors, "top_p", self.top_p, 0.0, 1.0);
        check_range(&mut errors, "repeat_penalty", self.repeat_penalty, 0.0, 2.0);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn check_range(errors: &mut Vec<String>, field: &str, value: Option<f32>, lo: f32, hi: f32) {
    if let Some(v) = value {
        // NaN fails both comparisons
        if !(v >= lo && v <= hi) {
            errors.push(format!("{field}: must be between {lo} and {hi}"));
        }
    }
}

/// The sampling parameters actually applied to a generation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationParameters {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub repeat_penalty: f32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerationMetadata {
    /// Wall-clock seconds spent inside the model call.
    pub generation_time: f64,
    pub tokens_generated: u32,
    pub model_path: String,
    pub parameters: GenerationParameters,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerationResult {
    pub response: String,
    pub metadata: GenerationMetadata,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeConfigEcho {
    pub context_size: u32,
    pub thread_count: u32,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub repeat_penalty: f32,
}

/// Point-in-time view of the model runtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeStatus {
    pub state: LifecycleState,
    pub ready: bool,
    pub model_path: String,
    pub model_exists: bool,
    pub last_error: Option<String>,
    pub last_inference_at: Option<DateTime<Utc>>,
    pub loaded_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub generations_completed: u64,
    pub provider: ProviderInfo,
    pub config: RuntimeConfigEcho,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_prompt_is_rejected() {
        let errs = GenerationRequest::new("").validate().unwrap_err();
        assert_eq!(errs.len(), 1);
        assert!(errs[0].starts_with("prompt"));
    }

    #[test]
    fn oversized_prompt_is_rejected() {
        let req = GenerationRequest::new("x".repeat(MAX_PROMPT_CHARS + 1));
        assert!(req.validate().is_err());
        let req = GenerationRequest::new("x".repeat(MAX_PROMPT_CHARS));
        assert!(req.validate().is_ok());
    }

    #[test]
    fn out_of_range_overrides_are_all_reported() {
        let req = GenerationRequest {
            prompt: "hi".into(),
            max_tokens: Some(0),
            temperature: Some(2.5),
            top_p: Some(-0.1),
            repeat_penalty: Some(f32::NAN),
        };
        let errs = req.validate().unwrap_err();
        assert_eq!(errs.len(), 4);
    }

    #[test]
    fn boundary_values_are_accepted() {
        let req = GenerationRequest {
            prompt: "2+2".into(),
            max_tokens: Some(MAX_TOKENS_LIMIT),
            temperature: Some(0.0),
            top_p: Some(1.0),
            repeat_penalty: Some(2.0),
        };
        assert!(req.validate().is_ok());
    }

    #[test]
    fn state_serializes_lowercase() {
        let v = serde_json::to_value(LifecycleState::Initializing).unwrap();
        assert_eq!(v, serde_json::json!("initializing"));
        assert_eq!(LifecycleState::Degraded.to_string(), "degraded");
    }
}
