//! Tracing initialization for ConHub services.

use std::env;
use std::str::FromStr;

use thiserror::Error;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

#[derive(Error, Debug)]
pub enum TracingError {
    #[error("a global tracing subscriber is already installed: {0}")]
    AlreadyInitialized(String),
}

/// Output format of the fmt layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            _ => Err(()),
        }
    }
}

/// Configuration for tracing initialization
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Service name for log attribution
    pub service_name: String,
    /// Environment (development, staging, production)
    pub environment: String,
    pub format: LogFormat,
    /// Filter directive used when `RUST_LOG` is absent (e.g. "info", "conhub_monitoring=debug,info")
    pub level: String,
    /// Whether to log span close events with their timings
    pub log_spans: bool,
    /// Whether to include file/line in logs
    pub include_location: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        let environment = env::var("ENVIRONMENT")
            .or_else(|_| env::var("NODE_ENV"))
            .unwrap_or_else(|_| "development".to_string());

        // Production defaults to JSON unless LOG_FORMAT says otherwise
        let format = env::var("LOG_FORMAT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(if environment == "production" {
                LogFormat::Json
            } else {
                LogFormat::Pretty
            });

        Self {
            service_name: "conhub".to_string(),
            environment,
            format,
            level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            log_spans: env::var("LOG_SPANS").map(|v| v == "true").unwrap_or(false),
            include_location: env::var("LOG_LOCATION").map(|v| v == "true").unwrap_or(false),
        }
    }
}

impl TracingConfig {
    /// Create config for a specific service
    pub fn for_service(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn json(mut self) -> Self {
        self.format = LogFormat::Json;
        self
    }

    pub fn pretty(mut self) -> Self {
        self.format = LogFormat::Pretty;
        self
    }

    pub fn with_spans(mut self) -> Self {
        self.log_spans = true;
        self
    }

    pub fn with_environment(mut self, env: impl Into<String>) -> Self {
        self.environment = env.into();
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.level))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Install the global subscriber, failing if one is already set.
pub fn try_init_tracing(config: &TracingConfig) -> Result<(), TracingError> {
    let span_events = if config.log_spans {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let result = match config.format {
        LogFormat::Json => {
            let layer = fmt::layer()
                .json()
                .with_timer(ChronoUtc::rfc_3339())
                .with_span_events(span_events)
                .with_current_span(true)
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_target(true);

            tracing_subscriber::registry()
                .with(config.filter())
                .with(layer)
                .try_init()
        }
        LogFormat::Pretty => {
            let layer = fmt::layer()
                .pretty()
                .with_timer(ChronoUtc::rfc_3339())
                .with_span_events(span_events)
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_target(true);

            tracing_subscriber::registry()
                .with(config.filter())
                .with(layer)
                .try_init()
        }
    };

    result.map_err(|e| TracingError::AlreadyInitialized(e.to_string()))?;

    tracing::info!(
        service = %config.service_name,
        environment = %config.environment,
        format = ?config.format,
        "Tracing initialized"
    );

    Ok(())
}

/// Initialize tracing with the given configuration
///
/// # Example
/// ```ignore
/// use conhub_observability::{init_tracing, TracingConfig};
///
/// init_tracing(TracingConfig::for_service("monitoring-service"));
/// ```
pub fn init_tracing(config: TracingConfig) {
    if let Err(e) = try_init_tracing(&config) {
        eprintln!("⚠️  [{}] {}", config.service_name, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = TracingConfig::for_service("test")
            .with_level("debug")
            .json()
            .with_spans()
            .with_environment("staging");

        assert_eq!(config.service_name, "test");
        assert_eq!(config.level, "debug");
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.environment, "staging");
        assert!(config.log_spans);
    }

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!("pretty".parse::<LogFormat>(), Ok(LogFormat::Pretty));
        assert!("yaml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_second_init_reports_error() {
        let config = TracingConfig::for_service("test").with_level("warn");
        let _ = try_init_tracing(&config);
        assert!(try_init_tracing(&config).is_err());
    }
}
