use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use thiserror::Error;

use crate::metrics::retention::RetentionPolicy;

// ─── Engine configuration ────────────────────────────────────────

/// Everything the engine consumes at startup. Every field has a default so
/// an empty TOML document is a valid configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Width of one aggregation bucket (seconds)
    #[serde(default = "default_window_size")]
    pub window_size_secs: u64,

    /// Buckets older than `now - horizon` are evicted (seconds)
    #[serde(default = "default_retention_horizon")]
    pub retention_horizon_secs: u64,

    /// How far in the past a sample may be and still be folded (seconds)
    #[serde(default = "default_late_sample_grace")]
    pub late_sample_grace_secs: u64,

    /// Pending flushes held before the oldest is dropped
    #[serde(default = "default_flush_queue_capacity")]
    pub flush_queue_capacity: usize,

    /// Background tasks draining the flush queue
    #[serde(default = "default_flush_workers")]
    pub flush_workers: usize,

    /// Buckets written per backend transaction / pipeline
    #[serde(default = "default_flush_batch_size")]
    pub flush_batch_size: usize,

    /// How often closed windows are finalized without waiting for traffic
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// Retention sweep period; defaults to one window
    #[serde(default)]
    pub sweep_interval_secs: Option<u64>,

    /// Upper bound on any single backend call
    #[serde(default = "default_backend_timeout_ms")]
    pub backend_timeout_ms: u64,

    #[serde(default = "default_flush_max_retries")]
    pub flush_max_retries: u32,

    #[serde(default = "default_flush_backoff_base_ms")]
    pub flush_backoff_base_ms: u64,

    #[serde(default = "default_flush_backoff_cap_ms")]
    pub flush_backoff_cap_ms: u64,

    /// Longest an ingest call waits for a series lock
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,

    /// Shutdown waits this long for the flush queue to drain
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// Entries in each top-N ranking
    #[serde(default = "default_rank_limit")]
    pub rank_limit: usize,

    /// Routes with fewer samples are left out of slowest / error-prone rankings
    #[serde(default = "default_rank_min_samples")]
    pub rank_min_samples: u64,

    #[serde(default = "default_system_sample_interval")]
    pub system_sample_interval_secs: u64,

    /// Route prefixes the request producer never samples
    #[serde(default)]
    pub ignored_routes: Vec<String>,

    #[serde(default)]
    pub backend: BackendKind,
}

fn default_window_size() -> u64 {
    10
}
fn default_retention_horizon() -> u64 {
    3_600
}
fn default_late_sample_grace() -> u64 {
    300
}
fn default_flush_queue_capacity() -> usize {
    1_024
}
fn default_flush_workers() -> usize {
    2
}
fn default_flush_batch_size() -> usize {
    128
}
fn default_flush_interval() -> u64 {
    1
}
fn default_backend_timeout_ms() -> u64 {
    2_000
}
fn default_flush_max_retries() -> u32 {
    5
}
fn default_flush_backoff_base_ms() -> u64 {
    50
}
fn default_flush_backoff_cap_ms() -> u64 {
    2_000
}
fn default_lock_wait_ms() -> u64 {
    5
}
fn default_drain_timeout() -> u64 {
    5
}
fn default_rank_limit() -> usize {
    5
}
fn default_rank_min_samples() -> u64 {
    5
}
fn default_system_sample_interval() -> u64 {
    5
}

/// Which storage variant backs the engine. Chosen once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendKind {
    /// Bounded in-process ring; lost on restart.
    #[default]
    Memory,
    /// Embedded SQLite file.
    File {
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,
    },
    /// Redis sorted sets.
    Networked {
        url: String,
        #[serde(default = "default_namespace")]
        namespace: String,
    },
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("metrics.db")
}
fn default_namespace() -> String {
    "metrics".into()
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for '{field}': {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window_size_secs: default_window_size(),
            retention_horizon_secs: default_retention_horizon(),
            late_sample_grace_secs: default_late_sample_grace(),
            flush_queue_capacity: default_flush_queue_capacity(),
            flush_workers: default_flush_workers(),
            flush_batch_size: default_flush_batch_size(),
            flush_interval_secs: default_flush_interval(),
            sweep_interval_secs: None,
            backend_timeout_ms: default_backend_timeout_ms(),
            flush_max_retries: default_flush_max_retries(),
            flush_backoff_base_ms: default_flush_backoff_base_ms(),
            flush_backoff_cap_ms: default_flush_backoff_cap_ms(),
            lock_wait_ms: default_lock_wait_ms(),
            drain_timeout_secs: default_drain_timeout(),
            rank_limit: default_rank_limit(),
            rank_min_samples: default_rank_min_samples(),
            system_sample_interval_secs: default_system_sample_interval(),
            ignored_routes: Vec::new(),
            backend: BackendKind::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size_secs == 0 {
            return Err(invalid("window_size_secs", "must be at least 1"));
        }
        if self.retention_horizon_secs == 0
            || self.retention_horizon_secs % self.window_size_secs != 0
        {
            return Err(invalid(
                "retention_horizon_secs",
                format!(
                    "must be a positive multiple of window_size_secs ({})",
                    self.window_size_secs
                ),
            ));
        }
        if self.late_sample_grace_secs > self.retention_horizon_secs {
            return Err(invalid(
                "late_sample_grace_secs",
                "must not exceed retention_horizon_secs",
            ));
        }
        if self.flush_queue_capacity == 0 {
            return Err(invalid("flush_queue_capacity", "must be at least 1"));
        }
        if self.flush_workers == 0 {
            return Err(invalid("flush_workers", "must be at least 1"));
        }
        if self.flush_batch_size == 0 {
            return Err(invalid("flush_batch_size", "must be at least 1"));
        }
        if self.sweep_interval_secs == Some(0) || self.flush_interval_secs == 0 {
            return Err(invalid("sweep_interval_secs", "intervals must be at least 1s"));
        }
        Ok(())
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            window_size_secs: self.window_size_secs as i64,
            horizon_secs: self.retention_horizon_secs as i64,
        }
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.unwrap_or(self.window_size_secs))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn system_sample_interval(&self) -> Duration {
        Duration::from_secs(self.system_sample_interval_secs.max(1))
    }
}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.into(),
    }
}

// ─── Command line ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendChoice {
    Memory,
    File,
    Networked,
}

/// Command-line / environment overrides layered on top of the TOML file.
#[derive(Debug, Parser)]
#[command(name = "metrics-dashboard", version, about = "Route and process metrics dashboard")]
pub struct Cli {
    /// TOML configuration file
    #[arg(long, env = "METRICS_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "METRICS_LISTEN", default_value = "0.0.0.0:3000")]
    pub listen: String,

    #[arg(long, env = "METRICS_BACKEND", value_enum)]
    pub backend: Option<BackendChoice>,

    #[arg(long, env = "METRICS_SQLITE_PATH")]
    pub sqlite_path: Option<PathBuf>,

    #[arg(long, env = "METRICS_REDIS_URL")]
    pub redis_url: Option<String>,

    #[arg(long, env = "METRICS_WINDOW_SIZE_SECS")]
    pub window_size_secs: Option<u64>,

    #[arg(long, env = "METRICS_RETENTION_HORIZON_SECS")]
    pub retention_horizon_secs: Option<u64>,
}

impl Cli {
    /// File (if any) first, then command-line overrides, then validation.
    pub fn load_config(&self) -> Result<EngineConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_file(path)?,
            None => EngineConfig::default(),
        };

        if let Some(secs) = self.window_size_secs {
            config.window_size_secs = secs;
        }
        if let Some(secs) = self.retention_horizon_secs {
            config.retention_horizon_secs = secs;
        }

        match self.backend {
            Some(BackendChoice::Memory) => config.backend = BackendKind::Memory,
            Some(BackendChoice::File) => {
                config.backend = BackendKind::File {
                    path: self.sqlite_path.clone().unwrap_or_else(default_sqlite_path),
                }
            }
            Some(BackendChoice::Networked) => {
                let url = self
                    .redis_url
                    .clone()
                    .ok_or_else(|| invalid("redis_url", "required for the networked backend"))?;
                config.backend = BackendKind::Networked {
                    url,
                    namespace: default_namespace(),
                };
            }
            None => {}
        }

        config.validate()?;
        Ok(config)
    }
}
