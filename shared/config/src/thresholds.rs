use serde::{Deserialize, Serialize};
use std::fmt;

/// Alerting limits used by the monitoring engine.
///
/// Percentages are in `[0, 100]`; `response_time` is in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thresholds {
    /// System memory usage, percent
    pub memory_usage: f64,
    /// Disk usage, percent
    pub disk_space: f64,
    /// Single request duration, milliseconds
    pub response_time: f64,
    /// Errors over total requests, percent
    pub error_rate: f64,
    /// Process CPU usage, percent
    pub cpu_usage: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            memory_usage: 85.0,
            disk_space: 90.0,
            response_time: 5000.0,
            error_rate: 5.0,
            cpu_usage: 80.0,
        }
    }
}

/// Partial threshold update. Missing fields keep their current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdsUpdate {
    pub memory_usage: Option<f64>,
    pub disk_space: Option<f64>,
    pub response_time: Option<f64>,
    pub error_rate: Option<f64>,
    pub cpu_usage: Option<f64>,
}

impl ThresholdsUpdate {
    pub fn response_time(ms: f64) -> Self {
        Self {
            response_time: Some(ms),
            ..Default::default()
        }
    }

    pub fn error_rate(percent: f64) -> Self {
        Self {
            error_rate: Some(percent),
            ..Default::default()
        }
    }
}

/// A threshold value outside its allowed range.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdViolation {
    pub field: &'static str,
    pub value: f64,
}

impl fmt::Display for ThresholdViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.field, self.value)
    }
}

impl Thresholds {
    /// Apply a partial update in place. No range checking happens here.
    pub fn merge(&mut self, update: ThresholdsUpdate) {
        if let Some(v) = update.memory_usage {
            self.memory_usage = v;
        }
        if let Some(v) = update.disk_space {
            self.disk_space = v;
        }
        if let Some(v) = update.response_time {
            self.response_time = v;
        }
        if let Some(v) = update.error_rate {
            self.error_rate = v;
        }
        if let Some(v) = update.cpu_usage {
            self.cpu_usage = v;
        }
    }

    /// Return every field that is not a percentage in `[0, 100]` (or, for
    /// `response_time`, not a positive duration).
    pub fn validate(&self) -> Vec<ThresholdViolation> {
        let percents = [
            ("memoryUsage", self.memory_usage),
            ("diskSpace", self.disk_space),
            ("errorRate", self.error_rate),
            ("cpuUsage", self.cpu_usage),
        ];

        let mut violations: Vec<ThresholdViolation> = percents
            .into_iter()
            .filter(|(_, value)| !value.is_finite() || !(0.0..=100.0).contains(value))
            .map(|(field, value)| ThresholdViolation { field, value })
            .collect();

        if !self.response_time.is_finite() || self.response_time <= 0.0 {
            violations.push(ThresholdViolation {
                field: "responseTime",
                value: self.response_time,
            });
        }

        violations
    }
}
