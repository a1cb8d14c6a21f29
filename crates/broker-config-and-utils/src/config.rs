//! Configuration management for the broker.

use crate::{parse_level, CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use stream_store::{StorePolicy, DEFAULT_LATENCY_SAMPLES, DEFAULT_STATS_WINDOW};
use wire_protocol_types::DEFAULT_MAX_FRAME_BYTES;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

const DEFAULT_BACKOFF_MAX_MS: u64 = 300_000;
const DEFAULT_IDEMPOTENCY_TTL_SECS: u64 = 300;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1_000;

/// Main broker configuration.
///
/// Every hardening knob is optional; leaving them unset runs the minimal
/// protocol (unbounded streams, unlimited immediate redelivery).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Optional TCP listen address (e.g. `127.0.0.1:7420`), served alongside the Unix socket.
    pub listen_addr: Option<String>,
    /// Longest accepted wire record.
    pub max_frame_bytes: usize,
    /// Pending envelopes allowed per stream before `StreamFull`.
    pub max_stream_depth: Option<usize>,
    /// Requeue inflight envelopes unacknowledged for this long.
    pub ack_timeout_ms: Option<u64>,
    /// Dead-letter an envelope after this many requeues.
    pub max_redeliveries: Option<u32>,
    /// Base redelivery delay.
    pub redelivery_backoff_ms: Option<u64>,
    /// Cap on the redelivery delay.
    pub redelivery_backoff_max_ms: u64,
    /// Window for `rateIn` / `rateOut`.
    pub stats_window_ms: u64,
    /// Latency samples kept per stream.
    pub latency_samples: usize,
    /// Offload payloads whose serialized size exceeds this to the blob store.
    pub blob_offload_bytes: Option<usize>,
    /// Directory for the filesystem blob store; in-memory when unset.
    pub blob_dir: Option<PathBuf>,
    /// How long idempotency keys replay their recorded outcome.
    pub idempotency_ttl_secs: u64,
    /// Interval of the timeout/backoff sweeper.
    pub sweep_interval_ms: u64,
    /// Job queue that receives dead-lettered envelopes; discarded when unset.
    pub dead_letter_queue: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            listen_addr: None,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_stream_depth: None,
            ack_timeout_ms: None,
            max_redeliveries: None,
            redelivery_backoff_ms: None,
            redelivery_backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            stats_window_ms: DEFAULT_STATS_WINDOW.as_millis() as u64,
            latency_samples: DEFAULT_LATENCY_SAMPLES,
            blob_offload_bytes: None,
            blob_dir: None,
            idempotency_ttl_secs: DEFAULT_IDEMPOTENCY_TTL_SECS,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            dead_letter_queue: None,
        }
    }
}

impl Config {
    /// Create a new Config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from the base directory, falling back to defaults.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    /// Override configuration from environment variables.
    fn load_from_env(&mut self) {
        if let Ok(log_level) = std::env::var("CREDITLINE_LOG_LEVEL") {
            self.log_level = log_level;
        }
        if let Ok(listen) = std::env::var("CREDITLINE_LISTEN") {
            let listen = listen.trim();
            if !listen.is_empty() {
                self.listen_addr = Some(listen.to_string());
            }
        }
    }

    /// Reject values the broker cannot run with.
    pub fn validate(&self) -> CoreResult<()> {
        if parse_level(&self.log_level).is_none() {
            return Err(CoreError::Config(format!(
                "unknown log_level '{}'",
                self.log_level
            )));
        }
        if self.max_frame_bytes == 0 {
            return Err(CoreError::Config("max_frame_bytes must be positive".into()));
        }
        if self.stats_window_ms == 0 {
            return Err(CoreError::Config("stats_window_ms must be positive".into()));
        }
        if self.latency_samples == 0 {
            return Err(CoreError::Config("latency_samples must be positive".into()));
        }
        if self.sweep_interval_ms == 0 {
            return Err(CoreError::Config("sweep_interval_ms must be positive".into()));
        }
        if self.ack_timeout_ms == Some(0) {
            return Err(CoreError::Config("ack_timeout_ms must be positive".into()));
        }
        if self.dead_letter_queue.as_deref().is_some_and(|q| q.trim().is_empty()) {
            return Err(CoreError::Config("dead_letter_queue must not be empty".into()));
        }
        Ok(())
    }

    /// Delivery policy for the stream store.
    pub fn store_policy(&self) -> StorePolicy {
        StorePolicy {
            max_stream_depth: self.max_stream_depth,
            ack_timeout: self.ack_timeout_ms.map(Duration::from_millis),
            max_redeliveries: self.max_redeliveries,
            redelivery_backoff: self.redelivery_backoff_ms.map(Duration::from_millis),
            redelivery_backoff_max: Duration::from_millis(self.redelivery_backoff_max_ms),
            stats_window: Duration::from_millis(self.stats_window_ms),
            latency_samples: self.latency_samples,
        }
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
        assert!(config.listen_addr.is_none());
        assert!(config.max_stream_depth.is_none());
        assert!(config.validate().is_ok());

        let policy = config.store_policy();
        assert!(policy.ack_timeout.is_none());
        assert_eq!(policy.stats_window, DEFAULT_STATS_WINDOW);
        assert_eq!(policy.redelivery_backoff_max, Duration::from_secs(300));
    }

    #[test]
    fn test_config_load_from_file_partial() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");

        let config_json = r#"{
            "log_level": "debug",
            "max_stream_depth": 1000,
            "ack_timeout_ms": 30000,
            "redelivery_backoff_ms": 500,
            "dead_letter_queue": "orders-dlq"
        }"#;
        std::fs::write(&config_path, config_json).unwrap();

        let config = Config::load_from_file(&config_path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.latency_samples, DEFAULT_LATENCY_SAMPLES);
        assert_eq!(config.dead_letter_queue.as_deref(), Some("orders-dlq"));

        let policy = config.store_policy();
        assert_eq!(policy.max_stream_depth, Some(1000));
        assert_eq!(policy.ack_timeout, Some(Duration::from_secs(30)));
        assert_eq!(policy.redelivery_backoff, Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_config_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let config = Config {
            log_level: "trace".to_string(),
            max_redeliveries: Some(5),
            blob_offload_bytes: Some(64 * 1024),
            ..Default::default()
        };
        config.save(&paths).unwrap();

        let loaded = Config::load_from_file(&paths.config_file()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_load_nonexistent_uses_defaults() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().join("missing"));

        let config = Config::load(&paths).unwrap();
        assert_eq!(config.max_frame_bytes, Config::default().max_frame_bytes);
    }

    #[test]
    fn test_config_validate_rejects_bad_values() {
        let bad_level = Config {
            log_level: "loud".to_string(),
            ..Default::default()
        };
        assert!(matches!(bad_level.validate(), Err(CoreError::Config(_))));

        let zero_frame = Config {
            max_frame_bytes: 0,
            ..Default::default()
        };
        assert!(zero_frame.validate().is_err());

        let zero_timeout = Config {
            ack_timeout_ms: Some(0),
            ..Default::default()
        };
        assert!(zero_timeout.validate().is_err());

        let blank_queue = Config {
            dead_letter_queue: Some("  ".to_string()),
            ..Default::default()
        };
        assert!(blank_queue.validate().is_err());
    }

    #[test]
    fn test_config_invalid_json() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(&config_path, "{ not json").unwrap();

        assert!(matches!(
            Config::load_from_file(&config_path),
            Err(CoreError::Json(_))
        ));
    }
}
