use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use chrono::Utc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitoringError {
    #[error("Failed to assemble report: {0}")]
    Reporting(String),
    #[error("Unknown periodic task: {0}")]
    UnknownTask(String),
}

impl ResponseError for MonitoringError {
    fn status_code(&self) -> StatusCode {
        match self {
            MonitoringError::UnknownTask(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        tracing::error!(error = %self, "Monitoring request failed");

        // Internals stay in the log; callers get a generic message
        let message = match self {
            MonitoringError::UnknownTask(_) => self.to_string(),
            _ => "Failed to collect metrics".to_string(),
        };

        HttpResponse::build(self.status_code()).json(serde_json::json!({
            "error": message,
            "timestamp": Utc::now(),
        }))
    }
}
