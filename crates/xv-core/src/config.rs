use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration (loaded from xv.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct XvConfig {
    pub daemon: DaemonConfig,
    pub engine: EngineConfig,
    pub watch: WatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker count (0 = cpu_count)
    pub parallelism: usize,
    /// Cipher chunk size in bytes (0 = built-in default)
    pub buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism: 0,
            buffer_size: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Directory observed for new files
    pub source: PathBuf,
    /// Directory the encrypted outputs are written to
    pub target: PathBuf,
    /// Watcher tick frequency in milliseconds; the quiescence window before
    /// a file is dispatched is three times this value
    pub poll_interval_ms: u64,
    /// Forward watcher/dispatch errors on the errors channel
    pub notify_errors: bool,
    /// Emit a progress record per work unit
    pub report_progress: bool,
    /// Remove source files after successful encryption
    pub delete_completed: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            source: PathBuf::from("src"),
            target: PathBuf::from("target"),
            poll_interval_ms: 500,
            notify_errors: true,
            report_progress: true,
            delete_completed: false,
        }
    }
}
