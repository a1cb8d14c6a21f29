//! # Observability
//!
//! Structured logging for Creditline services.
//!
//! Services call [`init_with_config`] once at startup and use the standard
//! `tracing` macros everywhere else. Every event is written as one JSON line
//! to a central file (`~/.creditline/logs/broker.jsonl` by default), so the
//! log can be followed with:
//!
//! - `tail -f ~/.creditline/logs/broker.jsonl | jq`
//! - `lnav ~/.creditline/logs/broker.jsonl`
//!
//! Fields recorded on enclosing spans (for example a connection's
//! `session_id`) are copied onto each event logged inside them.
//!
//! ## Usage
//!
//! ```rust,ignore
//! fn main() -> std::io::Result<()> {
//!     observability::init_with_config(observability::LogConfig {
//!         service_name: "broker".into(),
//!         default_level: "debug".into(),
//!         also_stderr: true,
//!         ..Default::default()
//!     })?;
//!     tracing::info!("ready");
//!     Ok(())
//! }
//! ```

mod json_layer;
mod writer;

pub use json_layer::{JsonLayer, LogEntry};
pub use writer::{CentralLogWriter, WriterFactory};

use std::io;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the service (e.g., "broker", "cli").
    /// Included in every log line for filtering.
    pub service_name: String,

    /// Default log level filter (e.g., "debug", "info", "warn").
    /// Can be overridden by `RUST_LOG` environment variable.
    pub default_level: String,

    /// Optional custom log file path.
    /// Defaults to `~/.creditline/logs/broker.jsonl`.
    pub log_path: Option<PathBuf>,

    /// Also emit human-readable logs to stderr.
    pub also_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".into(),
            default_level: "info".into(),
            log_path: None,
            also_stderr: false,
        }
    }
}

/// Central log file location, if a home directory can be found.
pub fn default_log_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".creditline").join("logs").join("broker.jsonl"))
}

/// Initialize logging with default settings for `service_name`.
pub fn init(service_name: &str) -> io::Result<()> {
    init_with_config(LogConfig {
        service_name: service_name.into(),
        ..Default::default()
    })
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize logging with custom configuration.
///
/// Fails if the log file cannot be opened or a global subscriber is
/// already installed.
pub fn init_with_config(config: LogConfig) -> io::Result<()> {
    let log_path = match config.log_path.clone().or_else(default_log_path) {
        Some(path) => path,
        None => {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "could not determine home directory for the log file",
            ))
        }
    };

    let writer = CentralLogWriter::new(&log_path)?;
    let json_layer = JsonLayer::new(config.service_name.clone(), WriterFactory::new(writer));

    let stderr_layer = config.also_stderr.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .compact()
            .with_writer(io::stderr)
            .with_filter(env_filter(&config.default_level))
    });

    tracing_subscriber::registry()
        .with(json_layer.with_filter(env_filter(&config.default_level)))
        .with(stderr_layer)
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::AlreadyExists, e.to_string()))?;

    tracing::info!(
        service = %config.service_name,
        log_path = %log_path.display(),
        "observability initialized"
    );
    Ok(())
}

/// Re-export tracing macros for convenience.
pub use tracing::{debug, error, info, instrument, trace, warn};

/// Re-export Level for advanced filtering.
pub use tracing::Level;
