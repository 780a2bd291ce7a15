use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::event_bus::MAX_CAPACITY as MAX_EVENT_CAPACITY;

const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_IDLE_TIMEOUT_MS: u64 = 300_000; // 5 minutes
const DEFAULT_REAPER_INTERVAL_MS: u64 = 60_000;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2_000;
const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024; // 16 MiB, room for base64 images
const DEFAULT_EVENT_CAPACITY: usize = 1_024;

/// How to launch one worker. The resolved dataset path is appended as the
/// final positional argument.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["kernel_runner.py".to_string()],
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorConfig {
    pub worker: WorkerConfig,
    /// Directory datasets are resolved against.
    pub upload_dir: PathBuf,
    pub startup_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub reaper_interval_ms: u64,
    pub shutdown_grace_ms: u64,
    /// Cap on undecoded worker output held while waiting for a newline.
    pub max_frame_bytes: usize,
    pub event_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            upload_dir: PathBuf::from("uploads"),
            startup_timeout_ms: DEFAULT_STARTUP_TIMEOUT_MS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            reaper_interval_ms: DEFAULT_REAPER_INTERVAL_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl SupervisorConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(contents).map_err(|source| ConfigError::Parse { source })?;
        config.validate()
    }

    pub fn validate(self) -> Result<Self, ConfigError> {
        let non_zero = [
            ("startup_timeout_ms", self.startup_timeout_ms),
            ("idle_timeout_ms", self.idle_timeout_ms),
            ("reaper_interval_ms", self.reaper_interval_ms),
            ("shutdown_grace_ms", self.shutdown_grace_ms),
            ("max_frame_bytes", self.max_frame_bytes as u64),
            ("event_capacity", self.event_capacity as u64),
        ];
        if let Some(&(field, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid {
                field,
                reason: "must be greater than zero",
            });
        }
        if self.event_capacity > MAX_EVENT_CAPACITY {
            return Err(ConfigError::Invalid {
                field: "event_capacity",
                reason: "must be at most 65536",
            });
        }
        if self.worker.program.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "worker.program",
                reason: "must not be empty",
            });
        }
        Ok(self)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
