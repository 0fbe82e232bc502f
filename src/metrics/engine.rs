use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::flush::{FlushQueue, FlushWorker, RetryPolicy};
use super::query::{OverviewRow, QueryEngine};
use super::retention::RetentionSweeper;
use super::{
    DashboardReport, Diagnostics, DiagnosticsSnapshot, IngestionGateway, Sample, SeriesKey,
    SeriesPoint,
};
use crate::backend::Backend;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::Result;

/// The one owned instance holding every aggregator, the chosen backend and
/// the background tasks. Construct it once at startup and pass it around.
pub struct MetricsEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    diagnostics: Arc<Diagnostics>,
    backend: Arc<Backend>,
    queue: Arc<FlushQueue>,
    gateway: Arc<IngestionGateway>,
    query: QueryEngine,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl MetricsEngine {
    /// Validate the configuration, open the backend and spawn the flush
    /// workers, the closed-window ticker and the retention sweeper.
    /// Must be called from inside a tokio runtime.
    pub async fn start(config: EngineConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let diagnostics = Arc::new(Diagnostics::new());
        let backend = Arc::new(Backend::open(&config, diagnostics.clone()).await?);
        let queue = Arc::new(FlushQueue::new(config.flush_queue_capacity, diagnostics.clone()));
        let gateway = Arc::new(IngestionGateway::new(
            queue.clone(),
            diagnostics.clone(),
            clock.clone(),
            config.window_size_secs as i64,
            config.late_sample_grace_secs as i64,
            config.lock_wait(),
        ));
        let query = QueryEngine::new(
            backend.clone(),
            gateway.clone(),
            config.rank_limit,
            config.rank_min_samples,
        );
        let (shutdown, _) = watch::channel(false);

        let engine = Self {
            config,
            clock,
            diagnostics,
            backend,
            queue,
            gateway,
            query,
            shutdown,
            workers: Mutex::new(Vec::new()),
            background: Mutex::new(Vec::new()),
        };
        engine.spawn_tasks();
        info!(
            backend = engine.backend.kind(),
            window_size_secs = engine.config.window_size_secs,
            retention_horizon_secs = engine.config.retention_horizon_secs,
            "metrics engine started"
        );
        Ok(engine)
    }

    fn spawn_tasks(&self) {
        let retry = RetryPolicy {
            max_retries: self.config.flush_max_retries,
            base: Duration::from_millis(self.config.flush_backoff_base_ms),
            cap: Duration::from_millis(self.config.flush_backoff_cap_ms),
        };
        let workers = (0..self.config.flush_workers)
            .map(|id| {
                let worker = FlushWorker {
                    id,
                    queue: self.queue.clone(),
                    backend: self.backend.clone(),
                    diagnostics: self.diagnostics.clone(),
                    retry,
                    batch_size: self.config.flush_batch_size,
                };
                tokio::spawn(worker.run())
            })
            .collect();
        *self.workers.lock() = workers;

        let ticker = {
            let gateway = self.gateway.clone();
            let clock = self.clock.clone();
            let mut shutdown = self.shutdown.subscribe();
            let mut interval = tokio::time::interval(self.config.flush_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            let flushed = gateway.flush_expired(clock.now_secs());
                            if flushed > 0 {
                                debug!(flushed, "closed windows handed to flush queue");
                            }
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            })
        };

        let sweeper = RetentionSweeper::new(
            self.backend.clone(),
            self.gateway.clone(),
            self.config.retention_policy(),
            self.clock.clone(),
            self.diagnostics.clone(),
        );
        let sweeper =
            tokio::spawn(sweeper.run(self.config.sweep_interval(), self.shutdown.subscribe()));

        *self.background.lock() = vec![ticker, sweeper];
    }

    /// Record one sample. Never blocks beyond the series lock wait and never
    /// fails; see [`Self::diagnostics`] for what was dropped.
    pub fn ingest(&self, sample: Sample) {
        self.gateway.ingest(sample);
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn now_secs(&self) -> i64 {
        self.clock.now_secs()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn query(&self) -> &QueryEngine {
        &self.query
    }

    pub async fn series(
        &self,
        key: &SeriesKey,
        ts_from: i64,
        ts_to: i64,
    ) -> Result<Vec<SeriesPoint>> {
        self.query.series(key, ts_from, ts_to).await
    }

    pub async fn report(&self, ts_from: i64, ts_to: i64) -> Result<DashboardReport> {
        self.query.report(ts_from, ts_to).await
    }

    pub async fn overview(&self, ts_from: i64, ts_to: i64) -> Result<Vec<OverviewRow>> {
        self.query.overview(ts_from, ts_to).await
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    pub async fn health(&self) -> Result<()> {
        self.backend.check_health().await
    }

    /// Run one retention pass now instead of waiting for the next tick.
    pub async fn sweep_now(&self) -> Result<u64> {
        RetentionSweeper::new(
            self.backend.clone(),
            self.gateway.clone(),
            self.config.retention_policy(),
            self.clock.clone(),
            self.diagnostics.clone(),
        )
        .sweep_once()
        .await
    }

    /// Hand every open bucket to the flush queue and wait until the queue
    /// is empty or `timeout` elapses. Returns whether it drained.
    pub async fn flush(&self, timeout: Duration) -> bool {
        self.gateway.flush_all();
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.queue.is_idle() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }

    /// Drop every open, queued and persisted bucket.
    pub async fn reset(&self) -> Result<()> {
        self.gateway.reset();
        self.queue.clear();
        self.backend.reset().await?;
        info!("metrics reset");
        Ok(())
    }

    /// Receiver that flips to `true` once shutdown begins.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Stop background tasks, flush every open bucket, drain the queue for
    /// at most `drain_timeout`, discard the rest and close the backend.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.send_replace(true);
        let background = std::mem::take(&mut *self.background.lock());
        for handle in background {
            let _ = handle.await;
        }

        let flushed = self.gateway.flush_all();
        self.queue.close();
        debug!(flushed, pending = self.queue.len(), "draining flush queue");

        let workers = std::mem::take(&mut *self.workers.lock());
        let aborts: Vec<_> = workers.iter().map(JoinHandle::abort_handle).collect();
        let drained = tokio::time::timeout(self.config.drain_timeout(), async {
            for worker in workers {
                let _ = worker.await;
            }
        })
        .await;

        if drained.is_err() {
            let discarded = self.queue.discard_pending();
            for abort in aborts {
                abort.abort();
            }
            warn!(discarded, "flush queue did not drain in time");
        }

        self.backend.close().await?;
        info!("metrics engine stopped");
        Ok(())
    }
}
