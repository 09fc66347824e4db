use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use super::alerts::{AlertManager, Observation};
use super::counters::normalize_endpoint;

/// Latency distribution of one endpoint window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PercentileSummary {
    pub count: usize,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Index of percentile `p` in a sorted window of `count` samples:
/// `floor(count * p)`, clamped to the last element.
pub fn percentile_index(count: usize, p: f64) -> usize {
    if count == 0 {
        return 0;
    }
    let idx = (count as f64 * p).floor() as usize;
    idx.min(count - 1)
}

/// Per-endpoint response time windows.
///
/// A window grows to `capacity` samples; the sample that would exceed it
/// triggers a batch drop down to the most recent `retain` samples. Every
/// recorded sample is also checked against the response-time threshold.
pub struct PerformanceWindowTracker {
    windows: DashMap<String, Vec<f64>>,
    capacity: usize,
    retain: usize,
    alerts: Arc<AlertManager>,
}

impl PerformanceWindowTracker {
    pub fn new(capacity: usize, retain: usize, alerts: Arc<AlertManager>) -> Self {
        Self {
            windows: DashMap::new(),
            capacity: capacity.max(1),
            retain: retain.clamp(1, capacity.max(1)),
            alerts,
        }
    }

    pub fn record(&self, endpoint: &str, duration_ms: f64) {
        let endpoint = normalize_endpoint(endpoint);

        {
            let mut window = self.windows.entry(endpoint.clone()).or_default();
            window.push(duration_ms);
            if window.len() > self.capacity {
                let drop = window.len() - self.retain;
                window.drain(..drop);
            }
        }

        self.alerts.evaluate(Observation::ResponseTime {
            endpoint,
            duration_ms,
        });
    }

    pub fn sample_count(&self, endpoint: &str) -> usize {
        self.windows
            .get(&normalize_endpoint(endpoint))
            .map(|w| w.len())
            .unwrap_or(0)
    }

    /// Samples currently held for an endpoint, oldest first
    pub fn samples(&self, endpoint: &str) -> Vec<f64> {
        self.windows
            .get(&normalize_endpoint(endpoint))
            .map(|w| w.value().clone())
            .unwrap_or_default()
    }

    /// Summary for one endpoint; `None` when it has no samples.
    pub fn percentiles(&self, endpoint: &str) -> Option<PercentileSummary> {
        let window = self.windows.get(&normalize_endpoint(endpoint))?;
        summarize(&window)
    }

    /// Summaries for every endpoint with at least one sample.
    pub fn report(&self) -> BTreeMap<String, PercentileSummary> {
        self.windows
            .iter()
            .filter_map(|entry| summarize(entry.value()).map(|s| (entry.key().clone(), s)))
            .collect()
    }
}

fn summarize(samples: &[f64]) -> Option<PercentileSummary> {
    if samples.is_empty() {
        return None;
    }

    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let count = sorted.len();
    let sum: f64 = sorted.iter().sum();

    Some(PercentileSummary {
        count,
        avg: sum / count as f64,
        min: sorted[0],
        max: sorted[count - 1],
        p50: sorted[percentile_index(count, 0.50)],
        p95: sorted[percentile_index(count, 0.95)],
        p99: sorted[percentile_index(count, 0.99)],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::SystemClock;
    use crate::services::events::EventBus;
    use conhub_config::Thresholds;
    use std::time::Duration;

    fn tracker() -> (PerformanceWindowTracker, Arc<AlertManager>) {
        let alerts = Arc::new(AlertManager::new(
            Thresholds::default(),
            Duration::from_secs(3600),
            100,
            Arc::new(SystemClock),
            EventBus::new(),
        ));
        (PerformanceWindowTracker::new(100, 50, alerts.clone()), alerts)
    }

    #[test]
    fn test_window_never_exceeds_capacity() {
        let (tracker, _) = tracker();
        for i in 0..1000 {
            tracker.record("/api/messages", i as f64);
            assert!(tracker.sample_count("/api/messages") <= 100);
        }
    }

    #[test]
    fn test_drop_keeps_most_recent_fifty() {
        let (tracker, _) = tracker();
        for i in 0..100 {
            tracker.record("/api/messages", i as f64);
        }
        assert_eq!(tracker.sample_count("/api/messages"), 100);

        tracker.record("/api/messages", 100.0);
        let expected: Vec<f64> = (51..=100).map(|i| i as f64).collect();
        assert_eq!(tracker.samples("/api/messages"), expected);
    }

    #[test]
    fn test_percentiles_use_floor_index() {
        let (tracker, _) = tracker();
        for v in [50.0, 10.0, 40.0, 20.0, 30.0] {
            tracker.record("/foo", v);
        }

        let summary = tracker.percentiles("/foo").unwrap();
        assert_eq!(summary.count, 5);
        assert_eq!(summary.min, 10.0);
        assert_eq!(summary.max, 50.0);
        assert_eq!(summary.avg, 30.0);
        // floor(5 * 0.5) = 2, floor(5 * 0.95) = 4, floor(5 * 0.99) = 4
        assert_eq!(summary.p50, 30.0);
        assert_eq!(summary.p95, 50.0);
        assert_eq!(summary.p99, 50.0);
    }

    #[test]
    fn test_percentile_indices_are_ordered_and_in_bounds() {
        for n in 1..=500 {
            let p50 = percentile_index(n, 0.50);
            let p95 = percentile_index(n, 0.95);
            let p99 = percentile_index(n, 0.99);
            assert!(p50 <= p95 && p95 <= p99 && p99 < n, "n = {}", n);
        }
    }

    #[test]
    fn test_empty_endpoints_are_omitted() {
        let (tracker, _) = tracker();
        assert!(tracker.percentiles("/never").is_none());
        tracker.record("/seen", 12.0);

        let report = tracker.report();
        assert_eq!(report.len(), 1);
        assert!(report.contains_key("/seen"));
    }

    #[test]
    fn test_endpoints_are_normalized() {
        let (tracker, _) = tracker();
        tracker.record("/users/1", 10.0);
        tracker.record("/users/2", 20.0);

        assert_eq!(tracker.sample_count("/users/:id"), 2);
        assert_eq!(tracker.report().keys().collect::<Vec<_>>(), vec!["/users/:id"]);
    }

    #[test]
    fn test_slow_sample_raises_alert_with_normalized_endpoint() {
        let (tracker, alerts) = tracker();
        alerts.set_thresholds(conhub_config::ThresholdsUpdate::response_time(100.0));

        tracker.record("/orders/991", 250.0);

        let active = alerts.active_alerts();
        assert_eq!(active.len(), 1);
        let json = serde_json::to_value(&active[0]).unwrap();
        assert_eq!(json["data"]["endpoint"], "/orders/:id");
        assert_eq!(json["data"]["duration"].as_f64(), Some(250.0));
    }
}
