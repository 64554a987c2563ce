use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use llm_runtime::{GenerationDefaults, RetryPolicy, RuntimeConfig, GIB};

use crate::paths::AppPaths;

pub const DEFAULT_MODEL_FILE: &str = "phi-3-medium-128k-instruct-q4_k_m.gguf";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,

    pub model_path: PathBuf,
    pub context_size: u32,
    pub thread_count: u32,
    /// Layers offloaded to the GPU; 0 keeps inference on the CPU.
    pub gpu_layers: u32,

    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub repeat_penalty: f32,
    pub system_prompt: Option<String>,

    pub load_retries: u32,
    pub retry_delay: Duration,
    pub min_available_memory_gb: u64,
    pub generate_timeout: Duration,
    pub shutdown_grace: Duration,

    pub data_dir: PathBuf,
    pub max_context_file_bytes: u64,
}

impl AppConfig {
    pub fn from_env(paths: &AppPaths) -> Result<Self> {
        Self::from_lookup(paths, |key| std::env::var(key).ok())
    }

    pub fn from_lookup(paths: &AppPaths, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let model_path = match var("MODEL_PATH").filter(|v| !v.trim().is_empty()) {
            Some(v) => paths.model_path(v.trim()),
            None => paths.models.join(DEFAULT_MODEL_FILE),
        };
        let data_dir = var("DATA_DIR")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| paths.data.clone());

        let cfg = Self {
            host: var("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse(&var, "PORT", 5005)?,
            model_path,
            context_size: parse(&var, "CONTEXT_LENGTH", 4096)?,
            thread_count: parse(&var, "MODEL_N_THREADS", 4)?,
            gpu_layers: parse(&var, "MODEL_GPU_LAYERS", 0)?,
            max_tokens: parse(&var, "MAX_TOKENS", 512)?,
            temperature: parse(&var, "TEMPERATURE", 0.7)?,
            top_p: parse(&var, "TOP_P", 0.9)?,
            repeat_penalty: parse(&var, "REPEAT_PENALTY", 1.1)?,
            system_prompt: var("SYSTEM_PROMPT").filter(|v| !v.trim().is_empty()),
            load_retries: parse(&var, "MODEL_LOAD_RETRIES", 3)?,
            retry_delay: Duration::from_secs(parse(&var, "MODEL_RETRY_DELAY_SECS", 5)?),
            min_available_memory_gb: parse(&var, "MIN_AVAILABLE_MEMORY_GB", 6)?,
            generate_timeout: Duration::from_secs(parse(&var, "GENERATE_TIMEOUT_SECS", 120)?),
            shutdown_grace: Duration::from_secs(parse(&var, "SHUTDOWN_GRACE_SECS", 30)?),
            data_dir,
            max_context_file_bytes: parse::<u64>(&var, "MAX_CONTEXT_FILE_MB", 10)? * 1024 * 1024,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        // A missing model file is not a config error: the service starts degraded.
        if self.context_size == 0 {
            bail!("CONTEXT_LENGTH must be greater than 0");
        }
        if self.thread_count == 0 {
            bail!("MODEL_N_THREADS must be greater than 0");
        }
        if self.max_tokens == 0 {
            bail!("MAX_TOKENS must be greater than 0");
        }
        if self.load_retries == 0 {
            bail!("MODEL_LOAD_RETRIES must be greater than 0");
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            bail!("TEMPERATURE must be between 0 and 2");
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            bail!("TOP_P must be between 0 and 1");
        }
        if !(0.0..=2.0).contains(&self.repeat_penalty) {
            bail!("REPEAT_PENALTY must be between 0 and 2");
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn context_dir(&self) -> PathBuf {
        self.data_dir.join("context")
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        let mut generation = GenerationDefaults {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            repeat_penalty: self.repeat_penalty,
            queue_timeout: self.generate_timeout,
            ..GenerationDefaults::default()
        };
        if let Some(p) = &self.system_prompt {
            generation.system_preamble = p.clone();
        }

        RuntimeConfig {
            model_path: self.model_path.clone(),
            context_size: self.context_size,
            thread_count: self.thread_count,
            min_available_memory_bytes: self.min_available_memory_gb * GIB,
            retry: RetryPolicy::fixed(self.load_retries, self.retry_delay),
            generation,
        }
    }
}

fn parse<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(key) {
        Some(v) if !v.trim().is_empty() => v
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for env var {key}: {v:?}")),
        _ => Ok(default),
    }
}
