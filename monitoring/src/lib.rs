pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod services;

pub use errors::MonitoringError;
pub use handlers::configure_routes;
pub use middleware::RequestMetrics;
pub use services::MonitoringEngine;
