pub mod alerts;
pub mod clock;
pub mod counters;
pub mod engine;
pub mod events;
pub mod health;
pub mod performance;
pub mod probes;
pub mod report;
pub mod scheduler;
pub mod system;

pub use alerts::{Alert, AlertManager, AlertPayload, Observation};
pub use clock::{Clock, ManualClock, SystemClock};
pub use counters::{normalize_endpoint, CounterStore, GaugeStore};
pub use engine::{MonitoringEngine, MonitoringEngineBuilder};
pub use events::{EventBus, MonitoringEvent};
pub use health::{CheckResult, HealthProbe, HealthRegistry, HealthReport, HealthStatus, ProbeStatus};
pub use performance::{PercentileSummary, PerformanceWindowTracker};
pub use probes::{CanaryStore, DatabaseProbe, MemoryProbe, PgCanaryStore, UptimeProbe};
pub use report::{HealthResponse, MetricsSnapshot};
pub use scheduler::{PeriodicTask, Scheduler, TickOutcome};
pub use system::{DiskReading, MemoryReading, ResourceReader, SysinfoReader, SystemSampler, SystemSnapshot};
