use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::thresholds::Thresholds;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
    #[error("threshold out of range: {0}")]
    Threshold(String),
}

/// Runtime settings for the monitoring service and its engine.
#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    pub service_name: String,
    pub version: String,
    pub environment: String,
    pub host: String,
    pub port: u16,

    pub thresholds: Thresholds,

    pub sampling_interval: Duration,
    pub health_check_interval: Duration,
    pub compaction_interval: Duration,
    pub alert_sweep_interval: Duration,
    /// How long a raised alert stays active
    pub alert_ttl: Duration,
    /// Window used to measure process CPU usage inside one sampling tick
    pub cpu_sample_window: Duration,

    /// Distinct counter keys allowed before compaction kicks in
    pub max_counter_keys: usize,
    /// Samples kept per endpoint before the oldest batch is dropped
    pub window_capacity: usize,
    /// Samples left in a window right after a drop
    pub window_retain: usize,
    /// Requests that must be seen before the error rate can alert
    pub error_rate_min_requests: u64,

    pub memory_headroom_percent: f64,
    pub disk_path: PathBuf,

    pub database_url: Option<String>,
    pub database_probe_timeout: Duration,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service_name: "monitoring-service".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
            host: "0.0.0.0".to_string(),
            port: 3020,
            thresholds: Thresholds::default(),
            sampling_interval: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(60),
            compaction_interval: Duration::from_secs(600),
            alert_sweep_interval: Duration::from_secs(60),
            alert_ttl: Duration::from_secs(3600),
            cpu_sample_window: Duration::from_millis(100),
            max_counter_keys: 1000,
            window_capacity: 100,
            window_retain: 50,
            error_rate_min_requests: 100,
            memory_headroom_percent: 90.0,
            disk_path: PathBuf::from("/"),
            database_url: None,
            database_probe_timeout: Duration::from_millis(500),
        }
    }
}

impl MonitoringConfig {
    /// Load configuration from `.env` and the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let defaults = Self::default();

        let environment = env::var("ENVIRONMENT")
            .or_else(|_| env::var("NODE_ENV"))
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.environment);

        // Prefer Neon when it is configured
        let database_url = env::var("DATABASE_URL_NEON")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()));

        let thresholds = Thresholds {
            memory_usage: parse_or("THRESHOLD_MEMORY_USAGE", defaults.thresholds.memory_usage)?,
            disk_space: parse_or("THRESHOLD_DISK_SPACE", defaults.thresholds.disk_space)?,
            response_time: parse_or(
                "THRESHOLD_RESPONSE_TIME_MS",
                defaults.thresholds.response_time,
            )?,
            error_rate: parse_or("THRESHOLD_ERROR_RATE", defaults.thresholds.error_rate)?,
            cpu_usage: parse_or("THRESHOLD_CPU_USAGE", defaults.thresholds.cpu_usage)?,
        };

        let violations = thresholds.validate();
        if !violations.is_empty() {
            let listed: Vec<String> = violations.iter().map(ToString::to_string).collect();
            return Err(ConfigError::Threshold(listed.join(", ")));
        }

        let config = Self {
            service_name: env::var("SERVICE_NAME").unwrap_or(defaults.service_name),
            version: env::var("SERVICE_VERSION").unwrap_or(defaults.version),
            environment,
            host: env::var("MONITORING_HOST").unwrap_or(defaults.host),
            port: parse_or("MONITORING_PORT", defaults.port)?,
            thresholds,
            sampling_interval: secs_or("SAMPLING_INTERVAL_SECS", defaults.sampling_interval)?,
            health_check_interval: secs_or(
                "HEALTH_CHECK_INTERVAL_SECS",
                defaults.health_check_interval,
            )?,
            compaction_interval: secs_or(
                "COMPACTION_INTERVAL_SECS",
                defaults.compaction_interval,
            )?,
            alert_sweep_interval: secs_or(
                "ALERT_SWEEP_INTERVAL_SECS",
                defaults.alert_sweep_interval,
            )?,
            alert_ttl: secs_or("ALERT_TTL_SECS", defaults.alert_ttl)?,
            cpu_sample_window: defaults.cpu_sample_window,
            max_counter_keys: parse_or("MAX_COUNTER_KEYS", defaults.max_counter_keys)?,
            window_capacity: defaults.window_capacity,
            window_retain: defaults.window_retain,
            error_rate_min_requests: defaults.error_rate_min_requests,
            memory_headroom_percent: parse_or(
                "MEMORY_HEADROOM_PERCENT",
                defaults.memory_headroom_percent,
            )?,
            disk_path: env::var("DISK_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.disk_path),
            database_url,
            database_probe_timeout: Duration::from_millis(parse_or(
                "DATABASE_PROBE_TIMEOUT_MS",
                defaults.database_probe_timeout.as_millis() as u64,
            )?),
        };

        tracing::debug!(
            service = %config.service_name,
            environment = %config.environment,
            port = config.port,
            database = config.database_url.is_some(),
            "Monitoring configuration loaded"
        );

        Ok(config)
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

fn parse_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim().parse::<T>().map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value: raw,
            })
        }
        _ => Ok(default),
    }
}

fn secs_or(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    let secs = parse_or(key, default.as_secs())?;
    if secs == 0 {
        return Err(ConfigError::Invalid {
            key: key.to_string(),
            value: "0".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}
