//! File system paths for the broker.

use crate::{CoreError, CoreResult};
use std::path::PathBuf;

/// Broker socket filename under the base directory.
const SOCKET_NAME: &str = "broker.sock";

/// Manages file system paths for the broker.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Base directory for broker runtime files (~/.creditline)
    base_dir: PathBuf,
}

impl Paths {
    /// Create a new Paths instance rooted at `~/.creditline`.
    pub fn new() -> CoreResult<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| CoreError::Path("Could not determine home directory".to_string()))?;

        Ok(Self {
            base_dir: home.join(".creditline"),
        })
    }

    /// Create a new Paths instance with a custom base directory.
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Get the base directory (~/.creditline).
    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// Get the config file path (~/.creditline/config.json).
    pub fn config_file(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    /// Get the broker socket path (~/.creditline/broker.sock).
    pub fn socket_file(&self) -> PathBuf {
        self.base_dir.join(SOCKET_NAME)
    }

    /// Get the PID file path (~/.creditline/broker.pid).
    pub fn pid_file(&self) -> PathBuf {
        self.base_dir.join("broker.pid")
    }

    /// Get the logs directory (~/.creditline/logs).
    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    /// Get the broker log file path (~/.creditline/logs/broker.jsonl).
    pub fn log_file(&self) -> PathBuf {
        self.logs_dir().join("broker.jsonl")
    }

    /// Get the default blob directory (~/.creditline/blobs).
    pub fn blobs_dir(&self) -> PathBuf {
        self.base_dir.join("blobs")
    }

    /// Ensure all required directories exist.
    pub fn ensure_dirs(&self) -> CoreResult<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}
