use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::probe::{ResourceProbe, SystemMetrics};
use crate::runtime::ModelRuntime;
use crate::types::{LifecycleState, RuntimeStatus};

/// Ordered by precedence: earlier variants win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Error,
    Critical,
    Warning,
    Booting,
    Degraded,
    Healthy,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthThresholds {
    pub cpu_critical_percent: f32,
    pub memory_warning_percent: f32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            cpu_critical_percent: 95.0,
            memory_warning_percent: 90.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: f64,
    pub system_info: Option<SystemMetrics>,
    pub llm_status: RuntimeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn classify(
    metrics: Option<&SystemMetrics>,
    state: LifecycleState,
    thresholds: &HealthThresholds,
) -> HealthStatus {
    let Some(m) = metrics else {
        return HealthStatus::Error;
    };
    if m.cpu_percent > thresholds.cpu_critical_percent {
        return HealthStatus::Critical;
    }
    if m.memory_percent > thresholds.memory_warning_percent {
        return HealthStatus::Warning;
    }
    match state {
        LifecycleState::Initializing => HealthStatus::Booting,
        LifecycleState::Ready => HealthStatus::Healthy,
        LifecycleState::Degraded | LifecycleState::Uninitialized => HealthStatus::Degraded,
    }
}

/// Read-only combination of host metrics and lifecycle state. Never waits on
/// the model lock and never triggers a load.
pub struct HealthAggregator {
    runtime: Arc<ModelRuntime>,
    probe: Arc<dyn ResourceProbe>,
    thresholds: HealthThresholds,
    started: Instant,
}

impl HealthAggregator {
    pub fn new(runtime: Arc<ModelRuntime>) -> Self {
        let probe = runtime.probe();
        Self {
            runtime,
            probe,
            thresholds: HealthThresholds::default(),
            started: Instant::now(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub async fn check(&self) -> HealthReport {
        let llm_status = self.runtime.status();

        let probe = self.probe.clone();
        let metrics = match tokio::task::spawn_blocking(move || probe.system()).await {
            Ok(Ok(m)) => Ok(m),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(format!("probe task failed: {e}")),
        };
        if let Err(e) = &metrics {
            warn!(error = %e, "health check could not sample host metrics");
        }

        let status = classify(metrics.as_ref().ok(), llm_status.state, &self.thresholds);
        let (system_info, error) = match metrics {
            Ok(m) => (Some(m), None),
            Err(e) => (None, Some(e)),
        };

        HealthReport {
            status,
            timestamp: Utc::now(),
            uptime_secs: self.started.elapsed().as_secs_f64(),
            system_info,
            llm_status,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeConfig;
    use crate::testing::{FixedProbe, RecordingSleeper, ScriptedProvider};
    use std::time::Duration;

    fn metrics(cpu: f32, mem: f32) -> SystemMetrics {
        let mut m = FixedProbe::healthy().metrics.unwrap();
        m.cpu_percent = cpu;
        m.memory_percent = mem;
        m
    }

    #[test]
    fn precedence_is_fixed() {
        let t = HealthThresholds::default();
        assert_eq!(classify(None, LifecycleState::Ready, &t), HealthStatus::Error);
        assert_eq!(
            classify(Some(&metrics(99.0, 99.0)), LifecycleState::Ready, &t),
            HealthStatus::Critical
        );
        assert_eq!(
            classify(Some(&metrics(10.0, 95.0)), LifecycleState::Initializing, &t),
            HealthStatus::Warning
        );
        assert_eq!(
            classify(Some(&metrics(10.0, 10.0)), LifecycleState::Initializing, &t),
            HealthStatus::Booting
        );
        assert_eq!(
            classify(Some(&metrics(10.0, 10.0)), LifecycleState::Degraded, &t),
            HealthStatus::Degraded
        );
        assert_eq!(
            classify(Some(&metrics(10.0, 10.0)), LifecycleState::Ready, &t),
            HealthStatus::Healthy
        );
    }

    #[test]
    fn thresholds_are_exclusive() {
        let t = HealthThresholds::default();
        assert_eq!(
            classify(Some(&metrics(95.0, 90.0)), LifecycleState::Ready, &t),
            HealthStatus::Healthy
        );
    }

    fn runtime(path: &str, probe: FixedProbe) -> Arc<ModelRuntime> {
        Arc::new(
            ModelRuntime::new(RuntimeConfig::new(path), Arc::new(ScriptedProvider::new()))
                .with_probe(Arc::new(probe))
                .with_sleeper(Arc::new(RecordingSleeper::default())),
        )
    }

    #[tokio::test]
    async fn missing_model_reports_degraded() {
        let rt = runtime("/missing/model.gguf", FixedProbe::healthy());
        rt.initialize(3).await;

        let report = HealthAggregator::new(rt).check().await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(report.system_info.is_some());
        assert_eq!(report.llm_status.model_path, "/missing/model.gguf");
    }

    #[tokio::test]
    async fn probe_failure_is_error_status_not_a_failure() {
        let rt = runtime("/missing/model.gguf", FixedProbe::broken());
        let report = HealthAggregator::new(rt).check().await;
        assert_eq!(report.status, HealthStatus::Error);
        assert!(report.error.unwrap().contains("/proc/stat"));
        assert!(report.system_info.is_none());
    }

    #[tokio::test]
    async fn cpu_pressure_overrides_lifecycle() {
        let rt = runtime("/missing/model.gguf", FixedProbe::with_load(99.5, 10.0));
        let report = HealthAggregator::new(rt).check().await;
        assert_eq!(report.status, HealthStatus::Critical);
    }

    #[tokio::test]
    async fn report_serializes_lowercase_status() {
        let rt = runtime("/missing/model.gguf", FixedProbe::healthy());
        let agg = HealthAggregator::new(rt).with_thresholds(HealthThresholds {
            cpu_critical_percent: 1.0,
            memory_warning_percent: 1.0,
        });
        let v = serde_json::to_value(agg.check().await).unwrap();
        assert_eq!(v["status"], "critical");
        assert!(v["llm_status"]["state"].is_string());
    }

    #[tokio::test]
    async fn override_probe_is_used() {
        let rt = runtime("/missing/model.gguf", FixedProbe::healthy());
        let mut slow = FixedProbe::with_load(10.0, 95.0);
        slow.delay = Duration::from_millis(5);
        let report = HealthAggregator::new(rt).with_probe(Arc::new(slow)).check().await;
        assert_eq!(report.status, HealthStatus::Warning);
    }
}
