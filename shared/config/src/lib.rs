//! Shared configuration for ConHub services.
//!
//! Everything is read from the process environment (with `.env` support) so
//! the same binary can run locally and in containers without code changes.

pub mod monitoring;
pub mod thresholds;

pub use monitoring::{ConfigError, MonitoringConfig};
pub use thresholds::{ThresholdViolation, Thresholds, ThresholdsUpdate};
