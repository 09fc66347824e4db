#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, HttpResponse};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use conhub_config::MonitoringConfig;
use conhub_monitoring::services::{
    CanaryStore, DatabaseProbe, DiskReading, MemoryReading, MonitoringEngine, ResourceReader,
};

const GB: u64 = 1024 * 1024 * 1024;

/// Reader for a quiet 8 GB machine
pub struct FixedReader;

impl ResourceReader for FixedReader {
    fn memory(&mut self) -> anyhow::Result<MemoryReading> {
        Ok(MemoryReading {
            process_resident_bytes: 128 * 1024 * 1024,
            process_virtual_bytes: GB,
            system_total_bytes: 8 * GB,
            system_free_bytes: 4 * GB,
        })
    }

    fn begin_cpu_sample(&mut self) {}

    fn end_cpu_sample(&mut self) -> f64 {
        7.5
    }

    fn disk(&mut self) -> anyhow::Result<DiskReading> {
        Ok(DiskReading::from_space(200 * GB, 150 * GB))
    }
}

/// Canary store whose backend is unreachable
pub struct UnreachableStore;

#[async_trait]
impl CanaryStore for UnreachableStore {
    async fn write_canary(&self, _id: Uuid, _written_at: DateTime<Utc>) -> anyhow::Result<()> {
        anyhow::bail!("connection refused")
    }

    async fn read_canary(&self, _id: Uuid) -> anyhow::Result<Option<DateTime<Utc>>> {
        anyhow::bail!("connection refused")
    }
}

pub fn engine() -> Arc<MonitoringEngine> {
    Arc::new(
        MonitoringEngine::builder(MonitoringConfig::default())
            .with_reader(|| Box::new(FixedReader))
            .build(),
    )
}

pub fn engine_with_failing_database(name: &str) -> Arc<MonitoringEngine> {
    Arc::new(
        MonitoringEngine::builder(MonitoringConfig::default())
            .with_reader(|| Box::new(FixedReader))
            .with_probe(Arc::new(DatabaseProbe::new(
                name.to_string(),
                Arc::new(UnreachableStore),
                Duration::from_millis(500),
            )))
            .build(),
    )
}

/// Application routes the middleware can observe
pub fn app_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/ok", web::get().to(|| async { HttpResponse::Ok().body("ok") }))
        .route(
            "/fail",
            web::get().to(|| async { HttpResponse::InternalServerError().body("boom") }),
        )
        .route(
            "/healthz",
            web::get().to(|| async { HttpResponse::Ok().body("ok") }),
        )
        .route(
            "/users/{id}",
            web::get().to(|| async { HttpResponse::Ok().body("user") }),
        );
}
