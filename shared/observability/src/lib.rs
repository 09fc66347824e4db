//! ConHub Observability Library
//!
//! Structured logging setup shared by ConHub services: one call installs a
//! `tracing` subscriber with an env-driven filter and either JSON (production)
//! or pretty (development) output.

pub mod init;

pub use init::*;

// Re-export tracing for convenience
pub use tracing::{debug, error, info, trace, warn, Level};
