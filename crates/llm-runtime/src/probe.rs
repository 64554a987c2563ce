//! Host resource sampling.
//!
//! Probes are plain blocking queries with no state of their own. `sysinfo`
//! reads `/proc` (Linux), `vm_stat`/`sysctl` (macOS) or the Win32 APIs, and CPU
//! usage needs two samples separated by a short interval, so callers run probes
//! on the blocking thread pool.

use std::path::Path;
use std::time::Duration;

use anyhow::bail;
use serde::{Deserialize, Serialize};
use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, RefreshKind, System};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub disk_percent: f32,
    pub process_count: usize,
    pub platform: String,
    pub total_memory_bytes: u64,
    pub available_memory_bytes: u64,
}

pub trait ResourceProbe: Send + Sync {
    fn memory(&self) -> anyhow::Result<MemorySnapshot>;
    fn system(&self) -> anyhow::Result<SystemMetrics>;
}

#[derive(Debug, Clone)]
pub struct SysinfoProbe {
    cpu_sample: Duration,
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            cpu_sample: Duration::from_millis(100).max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL),
        }
    }

    fn memory_of(sys: &System) -> anyhow::Result<MemorySnapshot> {
        let total_bytes = sys.total_memory();
        if total_bytes == 0 {
            bail!("host reported zero total memory");
        }
        Ok(MemorySnapshot {
            total_bytes,
            available_bytes: sys.available_memory(),
        })
    }
}

impl ResourceProbe for SysinfoProbe {
    fn memory(&self) -> anyhow::Result<MemorySnapshot> {
        let mut sys = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_memory();
        Self::memory_of(&sys)
    }

    fn system(&self) -> anyhow::Result<SystemMetrics> {
        let mut sys = System::new_with_specifics(
            RefreshKind::new()
                .with_memory(MemoryRefreshKind::everything())
                .with_cpu(CpuRefreshKind::new().with_cpu_usage()),
        );
        std::thread::sleep(self.cpu_sample);
        sys.refresh_cpu();
        sys.refresh_memory();
        sys.refresh_processes();

        let mem = Self::memory_of(&sys)?;
        let used = mem.total_bytes.saturating_sub(mem.available_bytes);

        Ok(SystemMetrics {
            cpu_percent: sys.global_cpu_info().cpu_usage(),
            memory_percent: percent(used, mem.total_bytes),
            disk_percent: root_disk_percent(),
            process_count: sys.processes().len(),
            platform: System::name().unwrap_or_else(|| std::env::consts::OS.to_string()),
            total_memory_bytes: mem.total_bytes,
            available_memory_bytes: mem.available_bytes,
        })
    }
}

fn percent(part: u64, whole: u64) -> f32 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 / whole as f64 * 100.0) as f32
}

/// Usage of the root mount, or of the largest disk when there is no `/`.
fn root_disk_percent() -> f32 {
    let disks = Disks::new_with_refreshed_list();
    let disk = disks
        .list()
        .iter()
        .find(|d| d.mount_point() == Path::new("/"))
        .or_else(|| disks.list().iter().max_by_key(|d| d.total_space()));

    match disk {
        Some(d) => percent(d.total_space().saturating_sub(d.available_space()), d.total_space()),
        None => 0.0,
    }
}
