//! Health probes and their aggregation.
//!
//! Probes in one run execute concurrently and fail independently: an `Err`
//! or a panic from one probe becomes an `error` result for that probe only.
//! Runs themselves never overlap; a second caller waits for the first.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;

use super::clock::Clock;
use super::events::{EventBus, MonitoringEvent};
use super::scheduler::PeriodicTask;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Healthy,
    Unhealthy,
    /// The probe itself failed to run
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseDetails {
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryDetails {
    pub used_bytes: u64,
    pub total_bytes: u64,
    pub usage_percent: f64,
    pub limit_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UptimeDetails {
    pub uptime_seconds: f64,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureDetails {
    pub error: String,
}

/// Probe-specific fields, flattened next to `status` in the report
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ProbeDetails {
    Database(DatabaseDetails),
    Memory(MemoryDetails),
    Uptime(UptimeDetails),
    Failure(FailureDetails),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub status: ProbeStatus,
    #[serde(flatten)]
    pub details: ProbeDetails,
}

impl CheckResult {
    pub fn healthy(details: ProbeDetails) -> Self {
        Self {
            status: ProbeStatus::Healthy,
            details,
        }
    }

    pub fn unhealthy(details: ProbeDetails) -> Self {
        Self {
            status: ProbeStatus::Unhealthy,
            details,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ProbeStatus::Error,
            details: ProbeDetails::Failure(FailureDetails {
                error: message.into(),
            }),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == ProbeStatus::Healthy
    }
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &str;

    /// Probes bound their own running time; the registry does not cancel them.
    async fn check(&self) -> anyhow::Result<CheckResult>;
}

/// Outcome of one registry run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: BTreeMap<String, CheckResult>,
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    pub fn failing_checks(&self) -> Vec<&str> {
        self.checks
            .iter()
            .filter(|(_, result)| !result.is_healthy())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

pub struct HealthRegistry {
    probes: RwLock<Vec<Arc<dyn HealthProbe>>>,
    last_known: RwLock<Option<HealthReport>>,
    run_lock: tokio::sync::Mutex<()>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    every: Duration,
}

impl HealthRegistry {
    pub fn new(events: EventBus, clock: Arc<dyn Clock>, every: Duration) -> Self {
        Self {
            probes: RwLock::new(Vec::new()),
            last_known: RwLock::new(None),
            run_lock: tokio::sync::Mutex::new(()),
            events,
            clock,
            every,
        }
    }

    /// Add a probe. A probe with the same name replaces the old one.
    pub fn register(&self, probe: Arc<dyn HealthProbe>) {
        let mut probes = self.probes.write();
        probes.retain(|p| p.name() != probe.name());
        tracing::debug!(probe = probe.name(), "Health probe registered");
        probes.push(probe);
    }

    /// Result of the most recent completed run
    pub fn last_known(&self) -> Option<HealthReport> {
        self.last_known.read().clone()
    }

    /// Run every probe and aggregate: unhealthy if any probe is not healthy.
    pub async fn run_all(&self) -> HealthReport {
        let _running = self.run_lock.lock().await;
        let started = Instant::now();

        let probes: Vec<Arc<dyn HealthProbe>> = self.probes.read().clone();
        let results = join_all(probes.into_iter().map(run_probe)).await;
        let checks: BTreeMap<String, CheckResult> = results.into_iter().collect();

        let status = if checks.values().all(CheckResult::is_healthy) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };

        let report = HealthReport {
            status,
            checks,
            timestamp: self.clock.now(),
        };

        if status == HealthStatus::Unhealthy {
            tracing::warn!(
                failing = ?report.failing_checks(),
                "Health check failed"
            );
        } else {
            tracing::debug!(
                probes = report.checks.len(),
                duration_ms = started.elapsed().as_millis() as u64,
                "Health check passed"
            );
        }

        let previous = self
            .last_known
            .write()
            .replace(report.clone())
            .map(|r| r.status);

        if previous != Some(status) {
            self.events.publish(MonitoringEvent::HealthStatusChanged {
                previous,
                current: status,
            });
        }

        report
    }
}

async fn run_probe(probe: Arc<dyn HealthProbe>) -> (String, CheckResult) {
    let name = probe.name().to_string();

    let result = match AssertUnwindSafe(probe.check()).catch_unwind().await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            tracing::debug!(probe = %name, error = %e, "Health probe returned an error");
            CheckResult::error(e.to_string())
        }
        Err(_) => {
            tracing::error!(probe = %name, "Health probe panicked");
            CheckResult::error("probe panicked")
        }
    };

    (name, result)
}

#[async_trait]
impl PeriodicTask for HealthRegistry {
    fn name(&self) -> &'static str {
        "health_checks"
    }

    fn interval(&self) -> Duration {
        self.every
    }

    async fn tick(&self) -> anyhow::Result<()> {
        self.run_all().await;
        Ok(())
    }
}
