use std::str::FromStr;
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use tracing_actix_web::TracingLogger;

use conhub_config::MonitoringConfig;
use conhub_monitoring::services::{DatabaseProbe, MonitoringEngine, PgCanaryStore};
use conhub_monitoring::{configure_routes, RequestMetrics};
use conhub_observability::{init_tracing, TracingConfig};

#[actix_web::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    let config = MonitoringConfig::from_env()?;

    let mut tracing_config = TracingConfig::for_service(config.service_name.clone())
        .with_environment(config.environment.clone());
    if config.is_production() {
        tracing_config = tracing_config.json();
    }
    init_tracing(tracing_config);

    let mut builder = MonitoringEngine::builder(config.clone());

    // The pool connects on first use so the service starts without a database
    match config.database_url.as_deref() {
        Some(database_url) => {
            tracing::info!("📊 [Monitoring Service] Database probe enabled");

            // Disable server-side prepared statements for pgbouncer/Neon
            let connect_options =
                PgConnectOptions::from_str(database_url)?.statement_cache_capacity(0);
            let pool = PgPoolOptions::new()
                .max_connections(2)
                .acquire_timeout(config.database_probe_timeout)
                .connect_lazy_with(connect_options);

            builder = builder.with_probe(Arc::new(DatabaseProbe::new(
                "database",
                Arc::new(PgCanaryStore::new(pool)),
                config.database_probe_timeout,
            )));
        }
        None => {
            tracing::warn!("[Monitoring Service] DATABASE_URL not set - database probe disabled");
        }
    }

    let engine = Arc::new(builder.build());
    engine.start();

    tracing::info!(
        "🚀 [Monitoring Service] Starting on {}:{} ({})",
        config.host,
        config.port,
        config.environment
    );

    let server_engine = engine.clone();
    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header();

        App::new()
            .app_data(web::Data::new(server_engine.clone()))
            .wrap(RequestMetrics::new(server_engine.clone()))
            .wrap(TracingLogger::default())
            .wrap(cors)
            .configure(configure_routes)
    })
    .bind((config.host.as_str(), config.port))?
    .run()
    .await?;

    engine.stop();
    tracing::info!("👋 [Monitoring Service] Shut down");

    Ok(())
}
