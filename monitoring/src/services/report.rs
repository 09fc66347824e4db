//! Response bodies for the health and metrics surfaces.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::health::{CheckResult, HealthReport, HealthStatus};
use super::performance::PercentileSummary;
use super::system::SystemSnapshot;

const BYTE_UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];

pub fn format_bytes(bytes: u64) -> String {
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < BYTE_UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, BYTE_UNITS[unit_index])
}

pub fn format_percent(value: f64) -> String {
    format!("{:.2}%", value)
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSummary {
    pub total: u64,
    pub errors: u64,
    /// Percentage, two decimals
    pub error_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySummary {
    pub usage: String,
    pub used: String,
    pub total: String,
    pub process_resident: String,
    pub process_virtual: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CpuSummary {
    pub usage: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskSummary {
    pub usage: String,
    pub free: String,
    pub total: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSummary {
    pub memory: MemorySummary,
    pub cpu: CpuSummary,
    pub disk: DiskSummary,
    pub sampled_at: DateTime<Utc>,
}

impl From<&SystemSnapshot> for SystemSummary {
    fn from(snapshot: &SystemSnapshot) -> Self {
        let memory = &snapshot.memory;
        Self {
            memory: MemorySummary {
                usage: format_percent(snapshot.memory_usage_percent),
                used: format_bytes(memory.system_used_bytes()),
                total: format_bytes(memory.system_total_bytes),
                process_resident: format_bytes(memory.process_resident_bytes),
                process_virtual: format_bytes(memory.process_virtual_bytes),
            },
            cpu: CpuSummary {
                usage: format_percent(snapshot.cpu_usage_percent),
            },
            disk: DiskSummary {
                usage: format_percent(snapshot.disk.usage_percent),
                free: format_bytes(snapshot.disk.free_bytes),
                total: format_bytes(snapshot.disk.total_bytes),
            },
            sampled_at: snapshot.timestamp,
        }
    }
}

/// Body of `GET /metrics`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    /// Seconds since the engine was built
    pub uptime: f64,
    pub requests: RequestSummary,
    /// `null` until the first sample completes
    pub system: Option<SystemSummary>,
    /// Last known overall status, `unknown` before the first run
    pub health: String,
    pub active_alerts: usize,
    pub performance: BTreeMap<String, PercentileSummary>,
}

impl MetricsSnapshot {
    pub fn health_label(last_known: Option<&HealthReport>) -> String {
        last_known
            .map(|report| report.status.as_str().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Body of `GET /health`
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime: f64,
    pub version: String,
    pub environment: String,
    pub checks: BTreeMap<String, CheckResult>,
}

impl HealthResponse {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::system::{DiskReading, MemoryReading};

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1023), "1023.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536 * 1024), "1.50 MB");
        assert_eq!(format_bytes(8 * 1024 * 1024 * 1024), "8.00 GB");
    }

    #[test]
    fn test_format_percent_and_rounding() {
        assert_eq!(format_percent(12.5), "12.50%");
        assert_eq!(round2(10.0 / 120.0 * 100.0), 8.33);
    }

    #[test]
    fn test_system_summary_formats_readings() {
        let snapshot = SystemSnapshot {
            timestamp: Utc::now(),
            memory: MemoryReading {
                process_resident_bytes: 1024,
                process_virtual_bytes: 2048,
                system_total_bytes: 4 * 1024 * 1024 * 1024,
                system_free_bytes: 1024 * 1024 * 1024,
            },
            memory_usage_percent: 75.0,
            cpu_usage_percent: 3.25,
            disk: DiskReading::from_space(1024, 256),
            uptime_seconds: 1.0,
        };

        let summary = SystemSummary::from(&snapshot);
        assert_eq!(summary.memory.usage, "75.00%");
        assert_eq!(summary.memory.used, "3.00 GB");
        assert_eq!(summary.cpu.usage, "3.25%");
        assert_eq!(summary.disk.free, "256.00 B");

        let json = serde_json::to_value(&summary).unwrap();
        assert!(json["memory"].get("processResident").is_some());
    }

    #[test]
    fn test_health_label_before_first_run() {
        assert_eq!(MetricsSnapshot::health_label(None), "unknown");
    }
}
