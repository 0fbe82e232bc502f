use thiserror::Error;

use crate::config::ConfigError;

/// Everything that can go wrong inside the aggregation engine.
///
/// None of these ever reach the monitored request path: ingestion swallows
/// them into `Diagnostics`, only the query side surfaces them.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Transient network / file I/O failure, including call timeouts.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A persisted bucket failed to deserialize.
    #[error("corrupt bucket in series '{series_key}': {reason}")]
    BackendCorrupt { series_key: String, reason: String },

    /// Malformed timestamp, negative duration, non-finite value.
    #[error("invalid sample: {0}")]
    InvalidSample(String),

    /// The flush queue was at capacity and its oldest bucket was dropped.
    #[error("flush queue full")]
    QueueFull,

    /// At least one series key failed to sweep; the others were still swept.
    #[error("retention sweep failed for {failed} of {total} series")]
    RetentionSweepPartialFailure { failed: usize, total: usize },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, MetricsError>;

impl MetricsError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_))
    }
}

impl From<rusqlite::Error> for MetricsError {
    fn from(e: rusqlite::Error) -> Self {
        Self::BackendUnavailable(format!("sqlite: {e}"))
    }
}

impl From<redis::RedisError> for MetricsError {
    fn from(e: redis::RedisError) -> Self {
        Self::BackendUnavailable(format!("redis: {e}"))
    }
}

impl From<tokio::time::error::Elapsed> for MetricsError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::BackendUnavailable("backend call timed out".into())
    }
}

impl From<tokio::task::JoinError> for MetricsError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::BackendUnavailable(format!("backend task failed: {e}"))
    }
}
