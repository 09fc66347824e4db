//! Periodic sampling of memory, CPU and disk usage.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use sysinfo::{CpuRefreshKind, DiskExt, Pid, ProcessExt, RefreshKind, System, SystemExt};

use super::alerts::AlertManager;
use super::clock::Clock;
use super::counters::GaugeStore;
use super::events::{EventBus, MonitoringEvent};
use super::scheduler::PeriodicTask;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryReading {
    /// Resident set size of this process
    pub process_resident_bytes: u64,
    /// Virtual memory reserved by this process
    pub process_virtual_bytes: u64,
    pub system_total_bytes: u64,
    /// Memory available to new allocations, system-wide
    pub system_free_bytes: u64,
}

impl MemoryReading {
    pub fn system_used_bytes(&self) -> u64 {
        self.system_total_bytes.saturating_sub(self.system_free_bytes)
    }

    /// `(total - free) / total * 100`, zero when total is unknown
    pub fn usage_percent(&self) -> f64 {
        if self.system_total_bytes == 0 {
            return 0.0;
        }
        self.system_used_bytes() as f64 / self.system_total_bytes as f64 * 100.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskReading {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub usage_percent: f64,
}

impl DiskReading {
    pub fn from_space(total_bytes: u64, free_bytes: u64) -> Self {
        let usage_percent = if total_bytes == 0 {
            0.0
        } else {
            total_bytes.saturating_sub(free_bytes) as f64 / total_bytes as f64 * 100.0
        };

        Self {
            total_bytes,
            free_bytes,
            usage_percent,
        }
    }
}

/// One sampling tick worth of readings
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSnapshot {
    pub timestamp: DateTime<Utc>,
    pub memory: MemoryReading,
    pub memory_usage_percent: f64,
    pub cpu_usage_percent: f64,
    pub disk: DiskReading,
    pub uptime_seconds: f64,
}

/// Access to OS and process resource counters.
///
/// CPU usage is measured across a window: `begin_cpu_sample`, wait, then
/// `end_cpu_sample` returns the busy percentage of this process over it.
pub trait ResourceReader: Send {
    fn memory(&mut self) -> anyhow::Result<MemoryReading>;

    fn begin_cpu_sample(&mut self);

    fn end_cpu_sample(&mut self) -> f64;

    fn disk(&mut self) -> anyhow::Result<DiskReading>;
}

/// [`ResourceReader`] backed by `sysinfo`.
pub struct SysinfoReader {
    system: System,
    pid: Option<Pid>,
    disk_path: PathBuf,
}

impl SysinfoReader {
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        let system = System::new_with_specifics(
            RefreshKind::new()
                .with_memory()
                .with_cpu(CpuRefreshKind::new().with_cpu_usage()),
        );

        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::warn!(error = e, "Cannot resolve own pid; process metrics disabled");
                None
            }
        };

        Self {
            system,
            pid,
            disk_path: disk_path.into(),
        }
    }

    fn refresh_process(&mut self) -> bool {
        match self.pid {
            Some(pid) => {
                // Process CPU usage is computed against global CPU time
                self.system.refresh_cpu_specifics(CpuRefreshKind::new().with_cpu_usage());
                self.system.refresh_process(pid)
            }
            None => false,
        }
    }
}

impl ResourceReader for SysinfoReader {
    fn memory(&mut self) -> anyhow::Result<MemoryReading> {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            anyhow::bail!("system memory total reported as zero");
        }

        let (resident, virt) = if self.refresh_process() {
            self.pid
                .and_then(|pid| self.system.process(pid))
                .map(|p| (p.memory(), p.virtual_memory()))
                .unwrap_or((0, 0))
        } else {
            (0, 0)
        };

        Ok(MemoryReading {
            process_resident_bytes: resident,
            process_virtual_bytes: virt,
            system_total_bytes: total,
            system_free_bytes: self.system.available_memory(),
        })
    }

    fn begin_cpu_sample(&mut self) {
        self.refresh_process();
    }

    fn end_cpu_sample(&mut self) -> f64 {
        if !self.refresh_process() {
            return 0.0;
        }
        self.pid
            .and_then(|pid| self.system.process(pid))
            .map(|p| p.cpu_usage() as f64)
            .unwrap_or(0.0)
    }

    fn disk(&mut self) -> anyhow::Result<DiskReading> {
        self.system.refresh_disks_list();

        let disk = self
            .system
            .disks()
            .iter()
            .filter(|d| is_under_mount(&self.disk_path, d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .ok_or_else(|| anyhow::anyhow!("no disk mounted for {}", self.disk_path.display()))?;

        Ok(DiskReading::from_space(disk.total_space(), disk.available_space()))
    }
}

/// Gauge keys written on every sample
pub mod gauge_keys {
    pub const PROCESS_RESIDENT_BYTES: &str = "system.memory.process_resident_bytes";
    pub const PROCESS_VIRTUAL_BYTES: &str = "system.memory.process_virtual_bytes";
    pub const MEMORY_USAGE_PERCENT: &str = "system.memory.usage_percent";
    pub const CPU_USAGE_PERCENT: &str = "system.cpu.usage_percent";
    pub const DISK_USAGE_PERCENT: &str = "system.disk.usage_percent";
    pub const DISK_FREE_BYTES: &str = "system.disk.free_bytes";
    pub const UPTIME_SECONDS: &str = "system.uptime_seconds";
}

pub struct SystemSampler {
    reader: Mutex<Box<dyn ResourceReader>>,
    gauges: Arc<GaugeStore>,
    alerts: Arc<AlertManager>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    latest: RwLock<Option<SystemSnapshot>>,
    every: Duration,
    cpu_window: Duration,
    started: Instant,
}

impl SystemSampler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        reader: Box<dyn ResourceReader>,
        gauges: Arc<GaugeStore>,
        alerts: Arc<AlertManager>,
        events: EventBus,
        clock: Arc<dyn Clock>,
        every: Duration,
        cpu_window: Duration,
        started: Instant,
    ) -> Self {
        Self {
            reader: Mutex::new(reader),
            gauges,
            alerts,
            events,
            clock,
            latest: RwLock::new(None),
            every,
            cpu_window,
            started,
        }
    }

    /// Most recent successful sample
    pub fn latest(&self) -> Option<SystemSnapshot> {
        self.latest.read().clone()
    }

    /// Take one sample, publish it to the gauges and run the system
    /// threshold checks. A disk read failure degrades to zeros.
    pub async fn sample(&self) -> anyhow::Result<SystemSnapshot> {
        let memory = self.reader.lock().memory()?;

        self.reader.lock().begin_cpu_sample();
        tokio::time::sleep(self.cpu_window).await;
        let cpu = self.reader.lock().end_cpu_sample();
        let cpu_usage_percent = if cpu.is_finite() { cpu.clamp(0.0, 100.0) } else { 0.0 };

        let disk_result = self.reader.lock().disk();
        let disk = disk_result.unwrap_or_else(|e| {
            tracing::debug!(error = %e, "Disk statistics unavailable; reporting zeros");
            DiskReading::default()
        });

        let snapshot = SystemSnapshot {
            timestamp: self.clock.now(),
            memory,
            memory_usage_percent: memory.usage_percent(),
            cpu_usage_percent,
            disk,
            uptime_seconds: self.started.elapsed().as_secs_f64(),
        };

        self.write_gauges(&snapshot);
        *self.latest.write() = Some(snapshot.clone());

        self.alerts.check_system(&snapshot);
        self.events.publish(MonitoringEvent::SampleRecorded(snapshot.clone()));

        tracing::debug!(
            memory_percent = snapshot.memory_usage_percent,
            cpu_percent = snapshot.cpu_usage_percent,
            disk_percent = snapshot.disk.usage_percent,
            "System resources sampled"
        );

        Ok(snapshot)
    }

    fn write_gauges(&self, snapshot: &SystemSnapshot) {
        use gauge_keys::*;

        self.gauges.set(PROCESS_RESIDENT_BYTES, snapshot.memory.process_resident_bytes as f64);
        self.gauges.set(PROCESS_VIRTUAL_BYTES, snapshot.memory.process_virtual_bytes as f64);
        self.gauges.set(MEMORY_USAGE_PERCENT, snapshot.memory_usage_percent);
        self.gauges.set(CPU_USAGE_PERCENT, snapshot.cpu_usage_percent);
        self.gauges.set(DISK_USAGE_PERCENT, snapshot.disk.usage_percent);
        self.gauges.set(DISK_FREE_BYTES, snapshot.disk.free_bytes as f64);
        self.gauges.set(UPTIME_SECONDS, snapshot.uptime_seconds);
    }
}

#[async_trait]
impl PeriodicTask for SystemSampler {
    fn name(&self) -> &'static str {
        "system_sampler"
    }

    fn interval(&self) -> Duration {
        self.every
    }

    async fn tick(&self) -> anyhow::Result<()> {
        self.sample().await.map(|_| ())
    }
}

/// Whether `path` lives on the filesystem mounted at `mount_point`
pub fn is_under_mount(path: &Path, mount_point: &Path) -> bool {
    path.starts_with(mount_point)
}
