//! Scripted providers, instrumented models and fixed probes for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{EngineError, LoadError};
use crate::probe::{MemorySnapshot, ResourceProbe, SystemMetrics};
use crate::provider::{Completion, CompletionParams, LoadRequest, LoadedModel, ModelProvider, ProviderInfo};
use crate::retry::Sleeper;
use crate::GIB;

/// Shared counters across every model a [`ScriptedProvider`] hands out.
#[derive(Debug, Default)]
pub struct ModelStats {
    pub active: AtomicUsize,
    pub max_concurrent: AtomicUsize,
    pub calls: AtomicUsize,
    pub prompts: Mutex<Vec<String>>,
    pub params: Mutex<Vec<CompletionParams>>,
}

impl ModelStats {
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub struct InstrumentedModel {
    stats: Arc<ModelStats>,
    reply: String,
    delay: Duration,
    fail: bool,
}

impl LoadedModel for InstrumentedModel {
    fn complete(&mut self, prompt: &str, params: &CompletionParams) -> Result<Completion, EngineError> {
        let now = self.stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_concurrent.fetch_max(now, Ordering::SeqCst);
        self.stats.calls.fetch_add(1, Ordering::SeqCst);
        self.stats.prompts.lock().push(prompt.to_string());
        self.stats.params.lock().push(params.clone());

        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.stats.active.fetch_sub(1, Ordering::SeqCst);

        if self.fail {
            return Err(EngineError::new("llama_decode returned -1"));
        }
        Ok(Completion {
            text: format!("  {}\n", self.reply),
            tokens_generated: self.reply.split_whitespace().count().max(1) as u32,
        })
    }
}

/// Provider whose load outcomes are scripted up front. Once the script runs
/// out every load succeeds.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<LoadError>>,
    pub attempts: AtomicU32,
    pub stats: Arc<ModelStats>,
    load_delay: Duration,
    reply: String,
    generation_delay: Duration,
    fail_generation: bool,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            attempts: AtomicU32::new(0),
            stats: Arc::new(ModelStats::default()),
            load_delay: Duration::ZERO,
            reply: "4".to_string(),
            generation_delay: Duration::ZERO,
            fail_generation: false,
        }
    }

    pub fn failing_with(self, errors: Vec<LoadError>) -> Self {
        *self.script.lock() = errors.into();
        self
    }

    pub fn with_load_delay(mut self, d: Duration) -> Self {
        self.load_delay = d;
        self
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = reply.into();
        self
    }

    pub fn with_generation_delay(mut self, d: Duration) -> Self {
        self.generation_delay = d;
        self
    }

    pub fn failing_generation(mut self) -> Self {
        self.fail_generation = true;
        self
    }
}

impl ModelProvider for ScriptedProvider {
    fn load(&self, _req: &LoadRequest) -> Result<Box<dyn LoadedModel>, LoadError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.load_delay.is_zero() {
            std::thread::sleep(self.load_delay);
        }
        if let Some(err) = self.script.lock().pop_front() {
            return Err(err);
        }
        Ok(Box::new(InstrumentedModel {
            stats: self.stats.clone(),
            reply: self.reply.clone(),
            delay: self.generation_delay,
            fail: self.fail_generation,
        }))
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "scripted".to_string(),
            detail: "test provider".to_string(),
        }
    }
}

/// Probe returning canned readings. `metrics: None` makes `system()` fail.
#[derive(Debug, Clone)]
pub struct FixedProbe {
    pub memory: MemorySnapshot,
    pub metrics: Option<SystemMetrics>,
    pub delay: Duration,
}

impl FixedProbe {
    pub fn healthy() -> Self {
        Self {
            memory: MemorySnapshot {
                total_bytes: 32 * GIB,
                available_bytes: 24 * GIB,
            },
            metrics: Some(SystemMetrics {
                cpu_percent: 12.0,
                memory_percent: 25.0,
                disk_percent: 40.0,
                process_count: 200,
                platform: "Linux".to_string(),
                total_memory_bytes: 32 * GIB,
                available_memory_bytes: 24 * GIB,
            }),
            delay: Duration::ZERO,
        }
    }

    pub fn with_available_memory(bytes: u64) -> Self {
        let mut p = Self::healthy();
        p.memory.available_bytes = bytes;
        p
    }

    pub fn with_load(cpu_percent: f32, memory_percent: f32) -> Self {
        let mut p = Self::healthy();
        if let Some(m) = p.metrics.as_mut() {
            m.cpu_percent = cpu_percent;
            m.memory_percent = memory_percent;
        }
        p
    }

    pub fn broken() -> Self {
        let mut p = Self::healthy();
        p.metrics = None;
        p
    }
}

impl ResourceProbe for FixedProbe {
    fn memory(&self) -> anyhow::Result<MemorySnapshot> {
        Ok(self.memory)
    }

    fn system(&self) -> anyhow::Result<SystemMetrics> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.metrics
            .clone()
            .ok_or_else(|| anyhow::anyhow!("permission denied reading /proc/stat"))
    }
}

/// Records requested delays and returns immediately.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn slept(&self) -> Vec<Duration> {
        self.slept.lock().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, d: Duration) {
        self.slept.lock().push(d);
        tokio::task::yield_now().await;
    }
}
