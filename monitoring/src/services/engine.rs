//! The monitoring engine: one explicitly constructed instance owned by the
//! service's startup code and shared with middleware and handlers.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use conhub_config::{MonitoringConfig, Thresholds, ThresholdsUpdate};

use super::alerts::{Alert, AlertManager, AlertSweep, ErrorRateCheck, Observation};
use super::clock::{Clock, SystemClock};
use super::counters::{normalize_endpoint, CounterCompaction, CounterStore, GaugeStore};
use super::events::EventBus;
use super::health::{HealthProbe, HealthRegistry};
use super::performance::PerformanceWindowTracker;
use super::probes::{MemoryProbe, UptimeProbe};
use super::report::{round2, HealthResponse, MetricsSnapshot, RequestSummary, SystemSummary};
use super::scheduler::{Scheduler, TickOutcome};
use super::system::{ResourceReader, SysinfoReader, SystemSampler};
use crate::errors::MonitoringError;

pub use super::counters::counter_keys;

type ReaderFactory = Box<dyn Fn() -> Box<dyn ResourceReader> + Send + Sync>;

pub struct MonitoringEngineBuilder {
    config: MonitoringConfig,
    reader_factory: Option<ReaderFactory>,
    clock: Option<Arc<dyn Clock>>,
    probes: Vec<Arc<dyn HealthProbe>>,
}

impl MonitoringEngineBuilder {
    /// Source of resource readings for the sampler and the memory probe.
    /// Defaults to `sysinfo`.
    pub fn with_reader<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn ResourceReader> + Send + Sync + 'static,
    {
        self.reader_factory = Some(Box::new(factory));
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Register an extra health probe next to the built-in memory and
    /// uptime probes.
    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probes.push(probe);
        self
    }

    pub fn build(self) -> MonitoringEngine {
        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let disk_path = config.disk_path.clone();
        let reader_factory: ReaderFactory = match self.reader_factory {
            Some(factory) => factory,
            None => Box::new(move || {
                Box::new(SysinfoReader::new(disk_path.clone())) as Box<dyn ResourceReader>
            }),
        };

        let started = Instant::now();
        let started_at = clock.now();
        let events = EventBus::new();

        let counters = Arc::new(CounterStore::new(config.max_counter_keys));
        let gauges = Arc::new(GaugeStore::new());
        let alerts = Arc::new(AlertManager::new(
            config.thresholds,
            config.alert_ttl,
            config.error_rate_min_requests,
            clock.clone(),
            events.clone(),
        ));
        let performance = Arc::new(PerformanceWindowTracker::new(
            config.window_capacity,
            config.window_retain,
            alerts.clone(),
        ));
        let sampler = Arc::new(SystemSampler::new(
            reader_factory(),
            gauges.clone(),
            alerts.clone(),
            events.clone(),
            clock.clone(),
            config.sampling_interval,
            config.cpu_sample_window,
            started,
        ));

        let health = Arc::new(HealthRegistry::new(
            events.clone(),
            clock.clone(),
            config.health_check_interval,
        ));
        health.register(Arc::new(MemoryProbe::new(
            reader_factory(),
            config.memory_headroom_percent,
        )));
        health.register(Arc::new(UptimeProbe::new(started, started_at)));
        for probe in self.probes {
            health.register(probe);
        }

        let mut scheduler = Scheduler::new();
        scheduler.register(sampler.clone());
        scheduler.register(health.clone());
        scheduler.register(Arc::new(CounterCompaction::new(
            counters.clone(),
            config.compaction_interval,
        )));
        scheduler.register(Arc::new(AlertSweep::new(
            alerts.clone(),
            config.alert_sweep_interval,
        )));
        scheduler.register(Arc::new(ErrorRateCheck::new(
            counters.clone(),
            alerts.clone(),
            config.sampling_interval,
        )));

        MonitoringEngine {
            config,
            counters,
            gauges,
            performance,
            alerts,
            sampler,
            health,
            events,
            scheduler,
            clock,
            started,
        }
    }
}

pub struct MonitoringEngine {
    config: MonitoringConfig,
    counters: Arc<CounterStore>,
    gauges: Arc<GaugeStore>,
    performance: Arc<PerformanceWindowTracker>,
    alerts: Arc<AlertManager>,
    sampler: Arc<SystemSampler>,
    health: Arc<HealthRegistry>,
    events: EventBus,
    scheduler: Scheduler,
    clock: Arc<dyn Clock>,
    started: Instant,
}

impl MonitoringEngine {
    pub fn builder(config: MonitoringConfig) -> MonitoringEngineBuilder {
        MonitoringEngineBuilder {
            config,
            reader_factory: None,
            clock: None,
            probes: Vec::new(),
        }
    }

    /// Start the periodic tasks. Requires a tokio runtime.
    pub fn start(&self) {
        self.scheduler.start();
        tracing::info!(
            tasks = ?self.scheduler.task_names(),
            "Monitoring engine started"
        );
    }

    pub fn stop(&self) {
        self.scheduler.stop();
        tracing::info!("Monitoring engine stopped");
    }

    /// Run one tick of a periodic task now, e.g. `system_sampler`.
    pub async fn run_task_once(&self, name: &str) -> Result<TickOutcome, MonitoringError> {
        self.scheduler.run_once(name).await
    }

    pub fn is_task_running(&self, name: &str) -> bool {
        self.scheduler.is_running(name)
    }

    pub fn config(&self) -> &MonitoringConfig {
        &self.config
    }

    pub fn counters(&self) -> &CounterStore {
        &self.counters
    }

    pub fn gauges(&self) -> &GaugeStore {
        &self.gauges
    }

    pub fn performance(&self) -> &PerformanceWindowTracker {
        &self.performance
    }

    pub fn alerts(&self) -> &AlertManager {
        &self.alerts
    }

    pub fn sampler(&self) -> &SystemSampler {
        &self.sampler
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    pub fn thresholds(&self) -> Thresholds {
        self.alerts.thresholds()
    }

    pub fn set_thresholds(&self, update: ThresholdsUpdate) -> Thresholds {
        self.alerts.set_thresholds(update)
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.alerts.active_alerts()
    }

    /// An inbound request was received.
    pub fn record_request(&self, method: &str, path: &str) {
        let method = method.to_ascii_uppercase();
        let endpoint = normalize_endpoint(path);

        let total = self.counters.increment(counter_keys::REQUESTS_TOTAL);
        self.counters.increment(&format!("requests.method.{}", method));
        self.counters.increment(&format!("requests.endpoint.{}", endpoint));

        // Errors seen before the minimum sample are judged once it is reached
        if total == self.config.error_rate_min_requests {
            self.evaluate_error_rate();
        }
    }

    /// A request completed. Statuses of 400 and above count as errors.
    pub fn record_response(&self, method: &str, path: &str, status: u16, duration_ms: f64) {
        self.counters.increment(&format!("responses.status.{}", status));
        self.counters.increment(&format!("responses.status.{}xx", status / 100));
        self.performance.record(path, duration_ms);

        if status >= 400 {
            tracing::debug!(method, path, status, duration_ms, "Request completed with error status");
            self.count_error(status);
        }
    }

    /// A request failed before producing a response.
    pub fn record_error(&self, status: u16, duration_ms: f64) {
        tracing::debug!(status, duration_ms, "Request failed");
        self.gauges.set("errors.last_duration_ms", duration_ms);
        self.count_error(status);
    }

    pub fn record_file_processed(&self, kind: &str, success: bool, duration_ms: f64) {
        self.counters.increment(counter_keys::FILES_PROCESSED_TOTAL);
        self.counters.increment(&format!("files.processed.{}", kind));
        if !success {
            self.counters.increment(counter_keys::FILES_ERRORS_TOTAL);
        }
        self.gauges.set("files.last_duration_ms", duration_ms);
    }

    fn count_error(&self, status: u16) {
        self.counters.increment(counter_keys::ERRORS_TOTAL);
        self.counters.increment(&format!("errors.status.{}", status));
        self.evaluate_error_rate();
    }

    fn evaluate_error_rate(&self) {
        self.alerts.evaluate(Observation::ErrorRate {
            errors: self.counters.get(counter_keys::ERRORS_TOTAL),
            total: self.counters.get(counter_keys::REQUESTS_TOTAL),
        });
    }

    /// Error rate as a percentage with two decimals
    pub fn error_rate(&self) -> f64 {
        let errors = self.counters.get(counter_keys::ERRORS_TOTAL);
        let total = self.counters.get(counter_keys::REQUESTS_TOTAL);
        round2(super::alerts::error_rate_percent(errors, total))
    }

    /// Assemble the metrics body from what the periodic tasks last produced.
    /// Never samples.
    pub fn metrics_snapshot(&self) -> Result<MetricsSnapshot, MonitoringError> {
        std::panic::catch_unwind(AssertUnwindSafe(|| self.build_snapshot())).map_err(|_| {
            MonitoringError::Reporting("panic while assembling metrics snapshot".to_string())
        })
    }

    fn build_snapshot(&self) -> MetricsSnapshot {
        let last_health = self.health.last_known();

        MetricsSnapshot {
            timestamp: self.clock.now(),
            uptime: self.uptime_seconds(),
            requests: RequestSummary {
                total: self.counters.get(counter_keys::REQUESTS_TOTAL),
                errors: self.counters.get(counter_keys::ERRORS_TOTAL),
                error_rate: self.error_rate(),
            },
            system: self.sampler.latest().as_ref().map(SystemSummary::from),
            health: MetricsSnapshot::health_label(last_health.as_ref()),
            active_alerts: self.alerts.active_count(),
            performance: self.performance.report(),
        }
    }

    /// Run every health probe now.
    pub async fn health_check(&self) -> HealthResponse {
        let report = self.health.run_all().await;

        HealthResponse {
            status: report.status,
            timestamp: report.timestamp,
            uptime: self.uptime_seconds(),
            version: self.config.version.clone(),
            environment: self.config.environment.clone(),
            checks: report.checks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::ManualClock;
    use crate::services::events::MonitoringEvent;
    use crate::services::health::HealthStatus;
    use crate::services::probes::tests::RefusingStore;
    use crate::services::probes::DatabaseProbe;
    use crate::services::system::tests::StaticReader;
    use std::time::Duration;

    fn engine() -> MonitoringEngine {
        MonitoringEngine::builder(MonitoringConfig::default())
            .with_reader(|| Box::new(StaticReader::healthy()))
            .build()
    }

    #[test]
    fn test_ingress_counter_keys() {
        let engine = engine();
        engine.record_request("get", "/users/42");
        engine.record_response("get", "/users/42", 200, 12.0);
        engine.record_request("POST", "/users");
        engine.record_response("POST", "/users", 503, 40.0);

        let counters = engine.counters();
        assert_eq!(counters.get("requests.total"), 2);
        assert_eq!(counters.get("requests.method.GET"), 1);
        assert_eq!(counters.get("requests.endpoint./users/:id"), 1);
        assert_eq!(counters.get("responses.status.200"), 1);
        assert_eq!(counters.get("responses.status.5xx"), 1);
        assert_eq!(counters.get("errors.total"), 1);
        assert_eq!(counters.get("errors.status.503"), 1);
        assert_eq!(engine.performance().sample_count("/users/:id"), 1);
    }

    #[test]
    fn test_record_error_counts_without_response() {
        let engine = engine();
        engine.record_request("GET", "/boom");
        engine.record_error(500, 3.0);

        assert_eq!(engine.counters().get("errors.total"), 1);
        assert_eq!(engine.counters().get("responses.status.500"), 0);
        assert_eq!(engine.error_rate(), 100.0);
    }

    #[test]
    fn test_file_processing_counters() {
        let engine = engine();
        engine.record_file_processed("pdf", true, 120.0);
        engine.record_file_processed("pdf", false, 80.0);
        engine.record_file_processed("image", true, 10.0);

        assert_eq!(engine.counters().get("files.processed.total"), 3);
        assert_eq!(engine.counters().get("files.processed.pdf"), 2);
        assert_eq!(engine.counters().get("files.errors.total"), 1);
        assert_eq!(engine.gauges().get("files.last_duration_ms"), Some(10.0));
        assert_eq!(engine.gauges().get("files.last_duration_ms.pdf"), None);
    }

    #[test]
    fn test_error_rate_scenario() {
        let engine = engine();
        for i in 0..120 {
            engine.record_request("GET", "/api/messages");
            let status = if i >= 110 { 500 } else { 200 };
            engine.record_response("GET", "/api/messages", status, 5.0);
        }

        let snapshot = engine.metrics_snapshot().unwrap();
        assert_eq!(snapshot.requests.total, 120);
        assert_eq!(snapshot.requests.errors, 10);
        assert_eq!(snapshot.requests.error_rate, 8.33);
        assert!(engine
            .active_alerts()
            .iter()
            .any(|a| a.alert_type() == "high_error_rate"));
    }

    #[test]
    fn test_early_errors_alert_when_minimum_reached() {
        let engine = engine();
        let mut events = engine.events().subscribe();
        for i in 0..120 {
            engine.record_request("GET", "/api/messages");
            let status = if i < 10 { 500 } else { 200 };
            engine.record_response("GET", "/api/messages", status, 5.0);
        }

        assert_eq!(engine.error_rate(), 8.33);
        let raised: Vec<_> = engine
            .active_alerts()
            .into_iter()
            .filter(|a| a.alert_type() == "high_error_rate")
            .collect();
        assert_eq!(raised.len(), 1);

        match events.try_recv().unwrap() {
            MonitoringEvent::AlertRaised(alert) => assert_eq!(alert.alert_type(), "high_error_rate"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_error_rate_check_task_rejudges_totals() {
        let engine = engine();
        engine.set_thresholds(ThresholdsUpdate::error_rate(50.0));
        for i in 0..120 {
            engine.record_request("GET", "/api/messages");
            let status = if i < 10 { 500 } else { 200 };
            engine.record_response("GET", "/api/messages", status, 5.0);
        }
        assert_eq!(engine.active_alerts().len(), 0);

        engine.set_thresholds(ThresholdsUpdate::error_rate(5.0));
        assert_eq!(
            engine.run_task_once("error_rate_check").await.unwrap(),
            TickOutcome::Completed
        );

        let active = engine.active_alerts();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].alert_type(), "high_error_rate");
    }

    #[test]
    fn test_snapshot_before_any_sample() {
        let engine = engine();
        let snapshot = engine.metrics_snapshot().unwrap();
        assert!(snapshot.system.is_none());
        assert_eq!(snapshot.health, "unknown");
        assert_eq!(snapshot.active_alerts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_task_once_feeds_snapshot() {
        let clock = Arc::new(ManualClock::default());
        let engine = MonitoringEngine::builder(MonitoringConfig::default())
            .with_reader(|| Box::new(StaticReader::healthy()))
            .with_clock(clock)
            .build();

        assert_eq!(
            engine.run_task_once("system_sampler").await.unwrap(),
            TickOutcome::Completed
        );
        assert_eq!(
            engine.run_task_once("health_checks").await.unwrap(),
            TickOutcome::Completed
        );

        let snapshot = engine.metrics_snapshot().unwrap();
        assert_eq!(snapshot.system.unwrap().cpu.usage, "12.50%");
        assert_eq!(snapshot.health, "healthy");

        assert!(matches!(
            engine.run_task_once("nope").await,
            Err(MonitoringError::UnknownTask(_))
        ));
    }

    #[tokio::test]
    async fn test_health_check_reports_failing_probe() {
        let engine = MonitoringEngine::builder(MonitoringConfig::default())
            .with_reader(|| Box::new(StaticReader::healthy()))
            .with_probe(Arc::new(DatabaseProbe::new(
                "firebase",
                Arc::new(RefusingStore),
                Duration::from_millis(500),
            )))
            .build();

        let response = engine.health_check().await;
        assert_eq!(response.status, HealthStatus::Unhealthy);
        assert!(!response.checks["firebase"].is_healthy());
        assert!(response.checks["uptime"].is_healthy());
        assert!(response.checks["memory"].is_healthy());
        assert_eq!(response.version, env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let engine = engine();
        engine.start();
        assert!(engine.is_task_running("alert_sweep"));
        assert!(engine.is_task_running("error_rate_check"));
        engine.stop();
        assert!(!engine.is_task_running("alert_sweep"));
    }
}
