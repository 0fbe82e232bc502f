//! Bucket persistence behind one contract, three interchangeable stores.
//!
//! The variant is picked once at startup from [`BackendKind`]; there is no
//! switching mid-process. Waiting on a store is bounded by the backend
//! timeout, and a call that gives up is reported as
//! [`MetricsError::BackendUnavailable`]:
//! - Redis calls run under `tokio::time::timeout`. An abandoned upsert may
//!   still have reached the server, so merges are tagged with a [`BatchId`]
//!   and the server skips buckets it has already applied for that batch.
//! - SQLite calls give up while waiting for the connection (or SQLite's
//!   own file lock), before anything is written. A transaction that has
//!   started always runs to completion and reports its real outcome.
//! - The in-process store does no I/O.
//!
//! Contract, identical across variants:
//! - `upsert` merges into `(series_key, window_start)`: counts and sums add,
//!   min/max combine. Two partial folds of one window never overwrite.
//! - `query` returns buckets ascending by `window_start` within an inclusive
//!   range; missing windows are omitted, not zero-filled.
//! - `delete_before` removes buckets with `window_start < cutoff` for every
//!   series whose key starts with the prefix.
//!
//! [`MetricsError::BackendUnavailable`]: crate::error::MetricsError::BackendUnavailable

pub mod memory;
pub mod redis;
pub mod sqlite;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use uuid::Uuid;

use crate::config::{BackendKind, EngineConfig};
use crate::error::Result;
use crate::metrics::{Bucket, Diagnostics, SeriesKey};

pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;
pub use self::sqlite::SqliteBackend;

/// The closed set of storage variants.
pub enum Store {
    Memory(MemoryBackend),
    File(SqliteBackend),
    Networked(RedisBackend),
}

/// Identity of one flush batch. Retrying a batch under the same id never
/// merges any of its buckets twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchId(Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

pub struct Backend {
    store: Store,
    timeout: Duration,
}

/// Run a SQLite call on the blocking pool and wait for its real outcome.
async fn blocking<T, F>(store: &SqliteBackend, call: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&SqliteBackend) -> Result<T> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || call(&store)).await?
}

impl Backend {
    /// Build the store named by the configuration.
    pub async fn open(config: &EngineConfig, diagnostics: Arc<Diagnostics>) -> Result<Self> {
        let store = match &config.backend {
            BackendKind::Memory => Store::Memory(MemoryBackend::new(config.retention_policy())),
            BackendKind::File { path } => {
                let path = path.clone();
                let lock_wait = config.backend_timeout();
                let store = tokio::task::spawn_blocking(move || {
                    SqliteBackend::open(&path, diagnostics)?.with_lock_wait(lock_wait)
                })
                .await??;
                Store::File(store)
            }
            BackendKind::Networked { url, namespace } => Store::Networked(
                tokio::time::timeout(
                    config.backend_timeout(),
                    RedisBackend::connect(url, namespace, diagnostics),
                )
                .await??,
            ),
        };
        let backend = Self::new(store, config.backend_timeout());
        info!(backend = backend.kind(), "metrics backend ready");
        Ok(backend)
    }

    pub fn new(store: Store, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn kind(&self) -> &'static str {
        match &self.store {
            Store::Memory(_) => "memory",
            Store::File(_) => "file",
            Store::Networked(_) => "networked",
        }
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, call).await?
    }

    /// Merge one bucket as its own batch.
    pub async fn upsert(&self, bucket: &Bucket) -> Result<()> {
        self.upsert_batch(std::slice::from_ref(bucket), BatchId::new())
            .await
    }

    /// Merge many buckets in one transaction / round of calls. Callers
    /// retrying a failed batch pass the same `batch` id and the same
    /// buckets in the same order.
    pub async fn upsert_batch(&self, buckets: &[Bucket], batch: BatchId) -> Result<()> {
        let buckets: Vec<Bucket> = buckets.iter().filter(|b| !b.is_empty()).cloned().collect();
        if buckets.is_empty() {
            return Ok(());
        }
        match &self.store {
            Store::Memory(store) => {
                for bucket in &buckets {
                    store.upsert(bucket);
                }
                Ok(())
            }
            Store::File(store) => blocking(store, move |s| s.upsert_batch(&buckets)).await,
            Store::Networked(store) => self.bounded(store.upsert_batch(&buckets, batch)).await,
        }
    }

    pub async fn query(&self, key: &SeriesKey, ts_from: i64, ts_to: i64) -> Result<Vec<Bucket>> {
        if ts_from > ts_to {
            return Ok(Vec::new());
        }
        match &self.store {
            Store::Memory(store) => Ok(store.query(key, ts_from, ts_to)),
            Store::File(store) => {
                let key = key.clone();
                blocking(store, move |s| s.query(&key, ts_from, ts_to)).await
            }
            Store::Networked(store) => self.bounded(store.query(key, ts_from, ts_to)).await,
        }
    }

    /// Returns how many buckets were removed.
    pub async fn delete_before(&self, prefix: &str, cutoff: i64) -> Result<u64> {
        match &self.store {
            Store::Memory(store) => Ok(store.delete_before(prefix, cutoff)),
            Store::File(store) => {
                let prefix = prefix.to_string();
                blocking(store, move |s| s.delete_before(&prefix, cutoff)).await
            }
            Store::Networked(store) => self.bounded(store.delete_before(prefix, cutoff)).await,
        }
    }

    pub async fn list_series_keys(&self, prefix: &str) -> Result<Vec<SeriesKey>> {
        match &self.store {
            Store::Memory(store) => Ok(store.list_series_keys(prefix)),
            Store::File(store) => {
                let prefix = prefix.to_string();
                blocking(store, move |s| s.list_series_keys(&prefix)).await
            }
            Store::Networked(store) => self.bounded(store.list_series_keys(prefix)).await,
        }
    }

    /// Remove every persisted bucket.
    pub async fn reset(&self) -> Result<()> {
        match &self.store {
            Store::Memory(store) => {
                store.reset();
                Ok(())
            }
            Store::File(store) => blocking(store, SqliteBackend::reset).await,
            Store::Networked(store) => self.bounded(store.reset()).await,
        }
    }

    pub async fn check_health(&self) -> Result<()> {
        match &self.store {
            Store::Memory(_) => Ok(()),
            Store::File(store) => blocking(store, SqliteBackend::check_health).await,
            Store::Networked(store) => self.bounded(store.check_health()).await,
        }
    }

    /// Release resources once no more flushes will arrive.
    pub async fn close(&self) -> Result<()> {
        match &self.store {
            Store::Memory(_) | Store::Networked(_) => Ok(()),
            Store::File(store) => blocking(store, SqliteBackend::checkpoint).await,
        }
    }
}
