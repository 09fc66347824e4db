use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::PgPool;
use uuid::Uuid;

use super::health::{
    CheckResult, DatabaseDetails, HealthProbe, MemoryDetails, ProbeDetails, UptimeDetails,
};
use super::system::ResourceReader;

/// Storage used by the database probe to prove a write/read round trip.
#[async_trait]
pub trait CanaryStore: Send + Sync {
    async fn write_canary(&self, id: Uuid, written_at: DateTime<Utc>) -> anyhow::Result<()>;

    async fn read_canary(&self, id: Uuid) -> anyhow::Result<Option<DateTime<Utc>>>;
}

/// Canary rows in Postgres. The table is created on first use.
pub struct PgCanaryStore {
    pool: PgPool,
    table_ready: AtomicBool,
}

impl PgCanaryStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            table_ready: AtomicBool::new(false),
        }
    }

    async fn ensure_table(&self) -> anyhow::Result<()> {
        if self.table_ready.load(Ordering::Acquire) {
            return Ok(());
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS monitoring_canary (
                id UUID PRIMARY KEY,
                written_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        self.table_ready.store(true, Ordering::Release);
        Ok(())
    }
}

#[async_trait]
impl CanaryStore for PgCanaryStore {
    async fn write_canary(&self, id: Uuid, written_at: DateTime<Utc>) -> anyhow::Result<()> {
        self.ensure_table().await?;

        sqlx::query(
            r#"
            INSERT INTO monitoring_canary (id, written_at)
            VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET written_at = EXCLUDED.written_at
            "#,
        )
        .bind(id)
        .bind(written_at)
        .execute(&self.pool)
        .await?;

        // Keep the table at a handful of rows
        sqlx::query("DELETE FROM monitoring_canary WHERE written_at < $1")
            .bind(written_at - chrono::Duration::hours(1))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn read_canary(&self, id: Uuid) -> anyhow::Result<Option<DateTime<Utc>>> {
        let written_at = sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT written_at FROM monitoring_canary WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(written_at)
    }
}

/// Writes a canary and reads it back within a deadline.
pub struct DatabaseProbe {
    name: String,
    store: Arc<dyn CanaryStore>,
    timeout: Duration,
}

impl DatabaseProbe {
    pub fn new(name: impl Into<String>, store: Arc<dyn CanaryStore>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            store,
            timeout,
        }
    }

    async fn round_trip(&self) -> anyhow::Result<()> {
        let id = Uuid::new_v4();
        let written_at = Utc::now();

        self.store.write_canary(id, written_at).await?;
        match self.store.read_canary(id).await? {
            Some(_) => Ok(()),
            None => anyhow::bail!("canary {} not found after write", id),
        }
    }
}

#[async_trait]
impl HealthProbe for DatabaseProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> anyhow::Result<CheckResult> {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, self.round_trip()).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(Ok(())) => CheckResult::healthy(ProbeDetails::Database(DatabaseDetails {
                latency_ms,
                error: None,
            })),
            Ok(Err(e)) => CheckResult::unhealthy(ProbeDetails::Database(DatabaseDetails {
                latency_ms,
                error: Some(e.to_string()),
            })),
            Err(_) => CheckResult::unhealthy(ProbeDetails::Database(DatabaseDetails {
                latency_ms,
                error: Some(format!("timed out after {}ms", self.timeout.as_millis())),
            })),
        };

        Ok(result)
    }
}

/// Healthy while used memory stays at or below `limit_percent` of the total.
///
/// Compares the process resident size against system memory; when the
/// process size is unknown the system-wide usage is used instead.
pub struct MemoryProbe {
    reader: Mutex<Box<dyn ResourceReader>>,
    limit_percent: f64,
}

impl MemoryProbe {
    pub fn new(reader: Box<dyn ResourceReader>, limit_percent: f64) -> Self {
        Self {
            reader: Mutex::new(reader),
            limit_percent,
        }
    }
}

#[async_trait]
impl HealthProbe for MemoryProbe {
    fn name(&self) -> &str {
        "memory"
    }

    async fn check(&self) -> anyhow::Result<CheckResult> {
        let reading = self.reader.lock().memory()?;

        let total_bytes = reading.system_total_bytes;
        let used_bytes = if reading.process_resident_bytes > 0 {
            reading.process_resident_bytes
        } else {
            reading.system_used_bytes()
        };
        let usage_percent = if total_bytes == 0 {
            0.0
        } else {
            used_bytes as f64 / total_bytes as f64 * 100.0
        };

        let details = ProbeDetails::Memory(MemoryDetails {
            used_bytes,
            total_bytes,
            usage_percent,
            limit_percent: self.limit_percent,
        });

        if usage_percent <= self.limit_percent {
            Ok(CheckResult::healthy(details))
        } else {
            Ok(CheckResult::unhealthy(details))
        }
    }
}

/// Always healthy; reports how long the process has been up.
pub struct UptimeProbe {
    started: Instant,
    started_at: DateTime<Utc>,
}

impl UptimeProbe {
    pub fn new(started: Instant, started_at: DateTime<Utc>) -> Self {
        Self {
            started,
            started_at,
        }
    }
}

#[async_trait]
impl HealthProbe for UptimeProbe {
    fn name(&self) -> &str {
        "uptime"
    }

    async fn check(&self) -> anyhow::Result<CheckResult> {
        Ok(CheckResult::healthy(ProbeDetails::Uptime(UptimeDetails {
            uptime_seconds: self.started.elapsed().as_secs_f64(),
            started_at: self.started_at,
        })))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::services::health::ProbeStatus;
    use crate::services::system::tests::StaticReader;
    use crate::services::system::MemoryReading;
    use dashmap::DashMap;

    /// In-memory canary store
    #[derive(Default)]
    pub(crate) struct MemoryCanaryStore {
        rows: DashMap<Uuid, DateTime<Utc>>,
    }

    #[async_trait]
    impl CanaryStore for MemoryCanaryStore {
        async fn write_canary(&self, id: Uuid, written_at: DateTime<Utc>) -> anyhow::Result<()> {
            self.rows.insert(id, written_at);
            Ok(())
        }

        async fn read_canary(&self, id: Uuid) -> anyhow::Result<Option<DateTime<Utc>>> {
            Ok(self.rows.get(&id).map(|r| *r.value()))
        }
    }

    /// Store that refuses every write
    pub(crate) struct RefusingStore;

    #[async_trait]
    impl CanaryStore for RefusingStore {
        async fn write_canary(&self, _id: Uuid, _written_at: DateTime<Utc>) -> anyhow::Result<()> {
            anyhow::bail!("permission denied")
        }

        async fn read_canary(&self, _id: Uuid) -> anyhow::Result<Option<DateTime<Utc>>> {
            Ok(None)
        }
    }

    struct HangingStore;

    #[async_trait]
    impl CanaryStore for HangingStore {
        async fn write_canary(&self, _id: Uuid, _written_at: DateTime<Utc>) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }

        async fn read_canary(&self, _id: Uuid) -> anyhow::Result<Option<DateTime<Utc>>> {
            Ok(None)
        }
    }

    /// Store that loses what it was given
    struct ForgetfulStore;

    #[async_trait]
    impl CanaryStore for ForgetfulStore {
        async fn write_canary(&self, _id: Uuid, _written_at: DateTime<Utc>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn read_canary(&self, _id: Uuid) -> anyhow::Result<Option<DateTime<Utc>>> {
            Ok(None)
        }
    }

    fn db_probe(store: Arc<dyn CanaryStore>) -> DatabaseProbe {
        DatabaseProbe::new("database", store, Duration::from_millis(500))
    }

    #[tokio::test]
    async fn test_database_round_trip_is_healthy() {
        let result = db_probe(Arc::new(MemoryCanaryStore::default())).check().await.unwrap();
        assert_eq!(result.status, ProbeStatus::Healthy);
    }

    #[tokio::test]
    async fn test_database_write_failure_is_unhealthy() {
        let result = db_probe(Arc::new(RefusingStore)).check().await.unwrap();
        assert_eq!(result.status, ProbeStatus::Unhealthy);

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["error"], "permission denied");
        assert!(json.get("latencyMs").is_some());
    }

    #[tokio::test]
    async fn test_missing_canary_is_unhealthy() {
        let result = db_probe(Arc::new(ForgetfulStore)).check().await.unwrap();
        assert_eq!(result.status, ProbeStatus::Unhealthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_database_timeout_is_unhealthy() {
        let result = db_probe(Arc::new(HangingStore)).check().await.unwrap();
        assert_eq!(result.status, ProbeStatus::Unhealthy);

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["error"], "timed out after 500ms");
    }

    #[tokio::test]
    async fn test_memory_headroom() {
        let mut reader = StaticReader::healthy();
        reader.memory = MemoryReading {
            process_resident_bytes: 95,
            process_virtual_bytes: 200,
            system_total_bytes: 100,
            system_free_bytes: 50,
        };
        let result = MemoryProbe::new(Box::new(reader), 90.0).check().await.unwrap();
        assert_eq!(result.status, ProbeStatus::Unhealthy);

        let result = MemoryProbe::new(Box::new(StaticReader::healthy()), 90.0)
            .check()
            .await
            .unwrap();
        assert_eq!(result.status, ProbeStatus::Healthy);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["limitPercent"].as_f64(), Some(90.0));
    }

    #[tokio::test]
    async fn test_uptime_is_always_healthy() {
        let probe = UptimeProbe::new(Instant::now(), Utc::now());
        let result = probe.check().await.unwrap();
        assert_eq!(result.status, ProbeStatus::Healthy);

        let json = serde_json::to_value(&result).unwrap();
        assert!(json["uptimeSeconds"].as_f64().unwrap() >= 0.0);
        assert!(json.get("startedAt").is_some());
    }
}
