use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::RuntimeError;

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Worker threads for CPU-bound tasks
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Jobs that may wait in front of the pool before submissions are refused
    #[serde(default = "default_worker_queue_capacity")]
    pub worker_queue_capacity: usize,

    /// Concurrent open sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Maximum lifetime of a single session
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,

    /// How long in-flight sessions may drain after shutdown is requested
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Interval between outbound heartbeats
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Outbound blobs larger than this are sent as `blob_chunk` messages
    #[serde(default = "default_blob_chunk_size")]
    pub blob_chunk_size: usize,

    /// Upper bound on a single reassembled inbound blob
    #[serde(default = "default_max_blob_bytes")]
    pub max_blob_bytes: usize,

    /// Run every task on the dispatcher thread
    #[serde(default)]
    pub disable_worker: bool,
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_worker_queue_capacity() -> usize {
    64
}

fn default_max_sessions() -> usize {
    1024
}

fn default_session_timeout() -> u64 {
    300
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_heartbeat_interval() -> u64 {
    10
}

fn default_blob_chunk_size() -> usize {
    8192
}

fn default_max_blob_bytes() -> usize {
    64 * 1024 * 1024
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            worker_queue_capacity: default_worker_queue_capacity(),
            max_sessions: default_max_sessions(),
            session_timeout_secs: default_session_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            blob_chunk_size: default_blob_chunk_size(),
            max_blob_bytes: default_max_blob_bytes(),
            disable_worker: false,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, RuntimeError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| RuntimeError::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        let config = Self::from_toml(&content)?;
        info!(
            max_workers = config.max_workers,
            max_sessions = config.max_sessions,
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, RuntimeError> {
        let config: RuntimeConfig =
            toml::from_str(content).map_err(|e| RuntimeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) {
        self.apply_vars(std::env::vars());
    }

    /// Apply overrides from `(name, value)` pairs; unparsable values are ignored
    pub fn apply_vars<I, K, V>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref().trim());
            let applied = match key {
                "MAX_REQUEST_TIMEOUT" => parse_into(value, &mut self.session_timeout_secs),
                "HEARTBEAT_INTERVAL" => parse_into(value, &mut self.heartbeat_interval_secs),
                "MAX_WORKERS" => parse_into(value, &mut self.max_workers),
                "WORKER_QUEUE_CAPACITY" => parse_into(value, &mut self.worker_queue_capacity),
                "SHUTDOWN_GRACE" => parse_into(value, &mut self.shutdown_grace_secs),
                "MAX_SESSIONS" => parse_into(value, &mut self.max_sessions),
                "DISABLE_WORKER" => {
                    self.disable_worker = matches!(value, "1" | "true" | "TRUE" | "yes");
                    true
                }
                _ => continue,
            };
            if !applied {
                warn!(var = key, value, "ignoring unparsable environment override");
            }
        }
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        if !self.disable_worker {
            if self.max_workers == 0 {
                return Err(RuntimeError::Config(
                    "max_workers must be at least 1 unless disable_worker is set".into(),
                ));
            }
            if self.worker_queue_capacity == 0 {
                return Err(RuntimeError::Config(
                    "worker_queue_capacity must be at least 1 unless disable_worker is set".into(),
                ));
            }
        }
        let sizes = [
            ("max_sessions", self.max_sessions as u64),
            ("session_timeout_secs", self.session_timeout_secs),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("blob_chunk_size", self.blob_chunk_size as u64),
            ("max_blob_bytes", self.max_blob_bytes as u64),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, value)| *value == 0) {
            return Err(RuntimeError::Config(format!("{} must be positive", name)));
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

fn parse_into<T: std::str::FromStr>(value: &str, slot: &mut T) -> bool {
    match value.parse() {
        Ok(v) => {
            *slot = v;
            true
        }
        Err(_) => false,
    }
}
