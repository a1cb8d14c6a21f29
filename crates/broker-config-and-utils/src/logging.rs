//! Logging initialization for the broker.
//!
//! Thin wrapper over the observability crate: structured JSONL goes to
//! `~/.creditline/logs/broker.jsonl` (or the path given), with `RUST_LOG`
//! taking precedence over the configured level.

use crate::{CoreError, CoreResult};
use std::path::Path;

/// Initialize the logging system for the broker.
///
/// # Example
///
/// ```ignore
/// init_logging("info", &paths.log_file(), true)?;
/// tracing::info!("Broker started");
/// ```
pub fn init_logging(level: &str, log_path: &Path, also_stderr: bool) -> CoreResult<()> {
    observability::init_with_config(observability::LogConfig {
        service_name: "broker".into(),
        default_level: level.into(),
        log_path: Some(log_path.to_path_buf()),
        also_stderr,
    })
    .map_err(|e| CoreError::Config(format!("failed to initialize logging: {}", e)))
}

/// Parse a log level string into a tracing Level.
pub fn parse_level(level: &str) -> Option<tracing::Level> {
    match level.to_lowercase().as_str() {
        "trace" => Some(tracing::Level::TRACE),
        "debug" => Some(tracing::Level::DEBUG),
        "info" => Some(tracing::Level::INFO),
        "warn" | "warning" => Some(tracing::Level::WARN),
        "error" => Some(tracing::Level::ERROR),
        _ => None,
    }
}
