use std::sync::Arc;

use actix_web::{web, HttpResponse};

use crate::services::MonitoringEngine;

/// Re-runs every probe; 200 when healthy, 503 otherwise.
pub async fn health_check(engine: web::Data<Arc<MonitoringEngine>>) -> HttpResponse {
    let response = engine.health_check().await;

    if response.is_healthy() {
        HttpResponse::Ok().json(response)
    } else {
        HttpResponse::ServiceUnavailable().json(response)
    }
}
