//! Threshold evaluation and short-lived alerts.
//!
//! Every breach creates a new alert keyed `<type>_<unix millis>`; nothing is
//! deduplicated or re-armed. An alert lives exactly `ttl` from the moment it
//! is raised: a deferred one-shot task removes it, reads filter out anything
//! older than `ttl`, and [`AlertSweep`] purges stragglers periodically.
//! [`ErrorRateCheck`] re-judges the running error rate on the sampling
//! cadence so errors that arrived early are not missed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;

use conhub_config::{Thresholds, ThresholdsUpdate};

use super::clock::Clock;
use super::counters::{counter_keys, CounterStore};
use super::events::{EventBus, MonitoringEvent};
use super::scheduler::PeriodicTask;
use super::system::SystemSnapshot;

/// Which configured limit an observation is compared against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdKind {
    MemoryUsage,
    DiskSpace,
    ResponseTime,
    ErrorRate,
    CpuUsage,
}

impl ThresholdKind {
    pub fn limit(&self, thresholds: &Thresholds) -> f64 {
        match self {
            ThresholdKind::MemoryUsage => thresholds.memory_usage,
            ThresholdKind::DiskSpace => thresholds.disk_space,
            ThresholdKind::ResponseTime => thresholds.response_time,
            ThresholdKind::ErrorRate => thresholds.error_rate,
            ThresholdKind::CpuUsage => thresholds.cpu_usage,
        }
    }
}

/// A measured value together with the context needed to describe a breach.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Memory {
        usage_percent: f64,
        used_bytes: u64,
        total_bytes: u64,
    },
    Cpu {
        usage_percent: f64,
    },
    Disk {
        usage_percent: f64,
        free_bytes: u64,
    },
    ResponseTime {
        endpoint: String,
        duration_ms: f64,
    },
    ErrorRate {
        errors: u64,
        total: u64,
    },
}

impl Observation {
    pub fn kind(&self) -> ThresholdKind {
        match self {
            Observation::Memory { .. } => ThresholdKind::MemoryUsage,
            Observation::Cpu { .. } => ThresholdKind::CpuUsage,
            Observation::Disk { .. } => ThresholdKind::DiskSpace,
            Observation::ResponseTime { .. } => ThresholdKind::ResponseTime,
            Observation::ErrorRate { .. } => ThresholdKind::ErrorRate,
        }
    }

    pub fn value(&self) -> f64 {
        match self {
            Observation::Memory { usage_percent, .. }
            | Observation::Cpu { usage_percent }
            | Observation::Disk { usage_percent, .. } => *usage_percent,
            Observation::ResponseTime { duration_ms, .. } => *duration_ms,
            Observation::ErrorRate { errors, total } => error_rate_percent(*errors, *total),
        }
    }

    fn into_payload(self, threshold: f64) -> AlertPayload {
        match self {
            Observation::Memory {
                usage_percent,
                used_bytes,
                total_bytes,
            } => AlertPayload::HighMemoryUsage(MemoryAlert {
                usage_percent,
                used_bytes,
                total_bytes,
                threshold,
            }),
            Observation::Cpu { usage_percent } => AlertPayload::HighCpuUsage(CpuAlert {
                usage_percent,
                threshold,
            }),
            Observation::Disk {
                usage_percent,
                free_bytes,
            } => AlertPayload::HighDiskUsage(DiskAlert {
                usage_percent,
                free_bytes,
                threshold,
            }),
            Observation::ResponseTime {
                endpoint,
                duration_ms,
            } => AlertPayload::SlowResponse(SlowResponseAlert {
                endpoint,
                duration: duration_ms,
                threshold,
            }),
            Observation::ErrorRate { errors, total } => AlertPayload::HighErrorRate(ErrorRateAlert {
                error_rate: error_rate_percent(errors, total),
                errors,
                total,
                threshold,
            }),
        }
    }
}

/// `errors / total * 100`, zero when nothing has been counted yet.
pub fn error_rate_percent(errors: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        errors as f64 / total as f64 * 100.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryAlert {
    pub usage_percent: f64,
    pub used_bytes: u64,
    pub total_bytes: u64,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuAlert {
    pub usage_percent: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskAlert {
    pub usage_percent: f64,
    pub free_bytes: u64,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlowResponseAlert {
    pub endpoint: String,
    /// Observed duration in milliseconds
    pub duration: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRateAlert {
    pub error_rate: f64,
    pub errors: u64,
    pub total: u64,
    pub threshold: f64,
}

/// Alert type and its data, serialized as `{"type": ..., "data": {...}}`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum AlertPayload {
    HighMemoryUsage(MemoryAlert),
    HighCpuUsage(CpuAlert),
    HighDiskUsage(DiskAlert),
    SlowResponse(SlowResponseAlert),
    HighErrorRate(ErrorRateAlert),
}

impl AlertPayload {
    pub fn alert_type(&self) -> &'static str {
        match self {
            AlertPayload::HighMemoryUsage(_) => "high_memory_usage",
            AlertPayload::HighCpuUsage(_) => "high_cpu_usage",
            AlertPayload::HighDiskUsage(_) => "high_disk_usage",
            AlertPayload::SlowResponse(_) => "slow_response",
            AlertPayload::HighErrorRate(_) => "high_error_rate",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub key: String,
    #[serde(flatten)]
    pub payload: AlertPayload,
    pub created_at: DateTime<Utc>,
    /// Always false: alerts expire, they are never resolved
    pub resolved: bool,
    #[serde(skip)]
    sequence: u64,
}

impl Alert {
    pub fn alert_type(&self) -> &'static str {
        self.payload.alert_type()
    }
}

pub struct AlertManager {
    thresholds: RwLock<Thresholds>,
    alerts: Arc<DashMap<String, Alert>>,
    ttl: Duration,
    error_rate_min_requests: u64,
    clock: Arc<dyn Clock>,
    events: EventBus,
    sequence: AtomicU64,
}

impl AlertManager {
    pub fn new(
        thresholds: Thresholds,
        ttl: Duration,
        error_rate_min_requests: u64,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        Self {
            thresholds: RwLock::new(thresholds),
            alerts: Arc::new(DashMap::new()),
            ttl,
            error_rate_min_requests,
            clock,
            events,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        *self.thresholds.read()
    }

    /// Merge a partial update into the current thresholds.
    ///
    /// Out-of-range values are logged but still applied.
    pub fn set_thresholds(&self, update: ThresholdsUpdate) -> Thresholds {
        let updated = {
            let mut thresholds = self.thresholds.write();
            thresholds.merge(update);
            *thresholds
        };

        for violation in updated.validate() {
            tracing::warn!(field = violation.field, value = violation.value, "Threshold outside expected range");
        }
        tracing::info!(thresholds = ?updated, "Alert thresholds updated");

        updated
    }

    /// Compare an observation against its threshold and raise an alert on
    /// breach. Error rates are ignored until enough requests were seen.
    pub fn evaluate(&self, observation: Observation) -> Option<Alert> {
        if let Observation::ErrorRate { total, .. } = observation {
            if total < self.error_rate_min_requests {
                return None;
            }
        }

        let threshold = observation.kind().limit(&self.thresholds.read());
        if observation.value() > threshold {
            Some(self.raise(observation.into_payload(threshold)))
        } else {
            None
        }
    }

    /// Evaluate memory, CPU and disk readings of one sample.
    pub fn check_system(&self, snapshot: &SystemSnapshot) -> Vec<Alert> {
        let observations = [
            Observation::Memory {
                usage_percent: snapshot.memory_usage_percent,
                used_bytes: snapshot.memory.system_used_bytes(),
                total_bytes: snapshot.memory.system_total_bytes,
            },
            Observation::Cpu {
                usage_percent: snapshot.cpu_usage_percent,
            },
            Observation::Disk {
                usage_percent: snapshot.disk.usage_percent,
                free_bytes: snapshot.disk.free_bytes,
            },
        ];

        observations
            .into_iter()
            .filter_map(|observation| self.evaluate(observation))
            .collect()
    }

    /// Store a new alert and schedule its removal after the TTL.
    pub fn raise(&self, payload: AlertPayload) -> Alert {
        let created_at = self.clock.now();
        let base_key = format!("{}_{}", payload.alert_type(), created_at.timestamp_millis());
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);

        // Same type within the same millisecond gets a suffix instead of
        // replacing the earlier alert.
        let mut key = base_key.clone();
        let mut suffix = 1;
        let alert = loop {
            match self.alerts.entry(key.clone()) {
                Entry::Vacant(slot) => {
                    let alert = Alert {
                        key: key.clone(),
                        payload,
                        created_at,
                        resolved: false,
                        sequence,
                    };
                    slot.insert(alert.clone());
                    break alert;
                }
                Entry::Occupied(_) => {
                    key = format!("{}_{}", base_key, suffix);
                    suffix += 1;
                }
            }
        };

        tracing::warn!(
            alert_type = alert.alert_type(),
            key = %alert.key,
            data = ?alert.payload,
            "Alert raised"
        );

        self.schedule_expiry(alert.key.clone());
        self.events.publish(MonitoringEvent::AlertRaised(alert.clone()));

        alert
    }

    fn schedule_expiry(&self, key: String) {
        // Without a runtime the read-side TTL filter and the sweep still apply
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let alerts = Arc::clone(&self.alerts);
        let ttl = self.ttl;
        runtime.spawn(async move {
            tokio::time::sleep(ttl).await;
            if alerts.remove(&key).is_some() {
                tracing::debug!(key = %key, "Alert expired");
            }
        });
    }

    fn is_expired(&self, alert: &Alert, now: DateTime<Utc>) -> bool {
        let age_ms = (now - alert.created_at).num_milliseconds();
        age_ms >= self.ttl.as_millis() as i64
    }

    /// All alerts younger than the TTL, newest first.
    pub fn active_alerts(&self) -> Vec<Alert> {
        let now = self.clock.now();
        let mut active: Vec<Alert> = self
            .alerts
            .iter()
            .filter(|entry| !self.is_expired(entry.value(), now))
            .map(|entry| entry.value().clone())
            .collect();

        active.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.sequence.cmp(&a.sequence))
        });
        active
    }

    pub fn active_count(&self) -> usize {
        let now = self.clock.now();
        self.alerts
            .iter()
            .filter(|entry| !self.is_expired(entry.value(), now))
            .count()
    }

    /// Number of stored alerts, expired or not
    pub fn stored_count(&self) -> usize {
        self.alerts.len()
    }

    /// Remove every alert older than the TTL. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.alerts.len();
        self.alerts.retain(|_, alert| !self.is_expired(alert, now));
        before.saturating_sub(self.alerts.len())
    }
}

/// Periodic purge of expired alerts.
pub struct AlertSweep {
    alerts: Arc<AlertManager>,
    every: Duration,
}

impl AlertSweep {
    pub fn new(alerts: Arc<AlertManager>, every: Duration) -> Self {
        Self { alerts, every }
    }
}

#[async_trait]
impl PeriodicTask for AlertSweep {
    fn name(&self) -> &'static str {
        "alert_sweep"
    }

    fn interval(&self) -> Duration {
        self.every
    }

    async fn tick(&self) -> anyhow::Result<()> {
        let removed = self.alerts.purge_expired();
        if removed > 0 {
            tracing::debug!(removed, "Expired alerts purged");
        }
        Ok(())
    }
}

/// Periodic evaluation of the cumulative error rate.
pub struct ErrorRateCheck {
    counters: Arc<CounterStore>,
    alerts: Arc<AlertManager>,
    every: Duration,
}

impl ErrorRateCheck {
    pub fn new(counters: Arc<CounterStore>, alerts: Arc<AlertManager>, every: Duration) -> Self {
        Self {
            counters,
            alerts,
            every,
        }
    }
}

#[async_trait]
impl PeriodicTask for ErrorRateCheck {
    fn name(&self) -> &'static str {
        "error_rate_check"
    }

    fn interval(&self) -> Duration {
        self.every
    }

    async fn tick(&self) -> anyhow::Result<()> {
        self.alerts.evaluate(Observation::ErrorRate {
            errors: self.counters.get(counter_keys::ERRORS_TOTAL),
            total: self.counters.get(counter_keys::REQUESTS_TOTAL),
        });
        Ok(())
    }
}
