//! Request accounting middleware.
//!
//! Feeds every request that passes through the app into the engine's ingress
//! hooks: the request itself before the handler runs, then the status and
//! duration once it completes.

use std::{
    future::{ready, Ready},
    rc::Rc,
    sync::Arc,
    time::Instant,
};

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error,
};
use futures_util::future::LocalBoxFuture;
use tracing::{debug, warn};

use crate::services::MonitoringEngine;

/// Paths that are served but never counted
pub const DEFAULT_EXCLUDED_PATHS: [&str; 3] = ["/health", "/metrics", "/favicon.ico"];

/// A path is excluded when it equals an entry or sits below it.
/// `/health` and `/health/live` match, `/healthz` does not.
fn is_excluded(path: &str, excluded: &[&str]) -> bool {
    excluded.iter().any(|prefix| match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    })
}

#[derive(Clone)]
pub struct RequestMetrics {
    engine: Arc<MonitoringEngine>,
}

impl RequestMetrics {
    pub fn new(engine: Arc<MonitoringEngine>) -> Self {
        Self { engine }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RequestMetrics
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RequestMetricsService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestMetricsService {
            service: Rc::new(service),
            engine: self.engine.clone(),
        }))
    }
}

pub struct RequestMetricsService<S> {
    service: Rc<S>,
    engine: Arc<MonitoringEngine>,
}

impl<S, B> Service<ServiceRequest> for RequestMetricsService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let engine = self.engine.clone();
        let excluded = is_excluded(req.path(), &DEFAULT_EXCLUDED_PATHS);

        Box::pin(async move {
            if excluded {
                return service.call(req).await;
            }

            let path = req.path().to_string();
            let method = req.method().to_string();
            engine.record_request(&method, &path);

            let start = Instant::now();
            let result = service.call(req).await;
            let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

            match result {
                Ok(res) => {
                    let status = res.status().as_u16();
                    engine.record_response(&method, &path, status, duration_ms);
                    debug!(method = %method, path = %path, status, duration_ms, "Request recorded");
                    Ok(res)
                }
                Err(e) => {
                    let status = e.as_response_error().status_code().as_u16();
                    engine.record_error(status, duration_ms);
                    warn!(method = %method, path = %path, status, error = %e, "Request failed");
                    Err(e)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusion_matches_whole_segments() {
        assert!(is_excluded("/health", &DEFAULT_EXCLUDED_PATHS));
        assert!(is_excluded("/health/live", &DEFAULT_EXCLUDED_PATHS));
        assert!(is_excluded("/metrics", &DEFAULT_EXCLUDED_PATHS));
        assert!(!is_excluded("/healthz", &DEFAULT_EXCLUDED_PATHS));
        assert!(!is_excluded("/metrics-export", &DEFAULT_EXCLUDED_PATHS));
        assert!(!is_excluded("/api/health", &DEFAULT_EXCLUDED_PATHS));
    }
}
