pub mod health;
pub mod metrics;

use actix_web::web;

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health::health_check))
        .service(
            web::scope("/metrics")
                .route("", web::get().to(metrics::get_metrics))
                .route("/alerts", web::get().to(metrics::get_alerts))
                .route("/performance", web::get().to(metrics::get_performance)),
        );
}
