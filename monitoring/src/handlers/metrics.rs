use std::sync::Arc;

use actix_web::{web, HttpResponse};
use chrono::Utc;
use serde_json::json;

use crate::errors::MonitoringError;
use crate::services::MonitoringEngine;

pub async fn get_metrics(
    engine: web::Data<Arc<MonitoringEngine>>,
) -> Result<HttpResponse, MonitoringError> {
    let snapshot = engine.metrics_snapshot()?;
    Ok(HttpResponse::Ok().json(snapshot))
}

pub async fn get_alerts(engine: web::Data<Arc<MonitoringEngine>>) -> HttpResponse {
    let alerts = engine.active_alerts();

    HttpResponse::Ok().json(json!({
        "count": alerts.len(),
        "alerts": alerts,
        "timestamp": Utc::now(),
    }))
}

pub async fn get_performance(engine: web::Data<Arc<MonitoringEngine>>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "endpoints": engine.performance().report(),
        "timestamp": Utc::now(),
    }))
}
