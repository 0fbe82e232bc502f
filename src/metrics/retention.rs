use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{Diagnostics, IngestionGateway};
use crate::backend::Backend;
use crate::clock::Clock;
use crate::error::{MetricsError, Result};

/// How long buckets live. `horizon_secs` is a multiple of `window_size_secs`
/// (enforced by config validation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub window_size_secs: i64,
    pub horizon_secs: i64,
}

impl RetentionPolicy {
    /// Buckets with `window_start` strictly below this are evicted.
    pub fn cutoff(&self, now: i64) -> i64 {
        now - self.horizon_secs
    }
}

/// Periodic eviction of buckets past the horizon, one series at a time.
pub struct RetentionSweeper {
    backend: Arc<Backend>,
    gateway: Arc<IngestionGateway>,
    policy: RetentionPolicy,
    clock: Arc<dyn Clock>,
    diagnostics: Arc<Diagnostics>,
}

impl RetentionSweeper {
    pub fn new(
        backend: Arc<Backend>,
        gateway: Arc<IngestionGateway>,
        policy: RetentionPolicy,
        clock: Arc<dyn Clock>,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Self {
            backend,
            gateway,
            policy,
            clock,
            diagnostics,
        }
    }

    /// One pass over every known series. A failing series is logged and
    /// skipped; the rest are still swept and the failure count is reported
    /// as [`MetricsError::RetentionSweepPartialFailure`]. Returns the number
    /// of persisted buckets removed.
    pub async fn sweep_once(&self) -> Result<u64> {
        let cutoff = self.policy.cutoff(self.clock.now_secs());

        // Open buckets first, under each series' own lock
        let evicted = self.gateway.evict_before(cutoff);
        if evicted > 0 {
            debug!(evicted, cutoff, "evicted stale open buckets");
        }

        let mut keys: BTreeSet<String> = match self.backend.list_series_keys("").await {
            Ok(keys) => keys.iter().map(ToString::to_string).collect(),
            Err(err) => {
                warn!(error = %err, "retention sweep could not list series");
                self.diagnostics.sweep_failed();
                return Err(err);
            }
        };
        keys.extend(self.gateway.series_keys("").iter().map(ToString::to_string));

        let total = keys.len();
        let mut failed = 0;
        let mut removed = 0;
        for key in &keys {
            match self.backend.delete_before(key, cutoff).await {
                Ok(n) => removed += n,
                Err(err) => {
                    warn!(series = %key, error = %err, "retention sweep failed for series");
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            self.diagnostics.sweep_failed();
            return Err(MetricsError::RetentionSweepPartialFailure { failed, total });
        }
        self.diagnostics.sweep_completed();
        debug!(series = total, removed, cutoff, "retention sweep done");
        Ok(removed)
    }

    /// Sweep every `interval` until `shutdown` flips to `true`.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "retention sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep_once().await {
                        warn!(error = %err, "retention sweep incomplete, retrying next cycle");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("retention sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BatchId, MemoryBackend, SqliteBackend, Store};
    use crate::clock::ManualClock;
    use crate::metrics::flush::FlushQueue;
    use crate::metrics::{Bucket, SeriesKey, SystemMetric};

    fn policy() -> RetentionPolicy {
        RetentionPolicy {
            window_size_secs: 60,
            horizon_secs: 600,
        }
    }

    fn sweeper(now: i64) -> (RetentionSweeper, Arc<Backend>, Arc<Diagnostics>) {
        sweeper_over(now, Store::Memory(MemoryBackend::new(policy())))
    }

    fn sweeper_over(now: i64, store: Store) -> (RetentionSweeper, Arc<Backend>, Arc<Diagnostics>) {
        let diagnostics = Arc::new(Diagnostics::new());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::at_secs(now));
        let backend = Arc::new(Backend::new(store, Duration::from_secs(1)));
        let queue = Arc::new(FlushQueue::new(16, diagnostics.clone()));
        let gateway = Arc::new(IngestionGateway::new(
            queue,
            diagnostics.clone(),
            clock.clone(),
            60,
            300,
            Duration::from_millis(10),
        ));
        let sweeper =
            RetentionSweeper::new(backend.clone(), gateway, policy(), clock, diagnostics.clone());
        (sweeper, backend, diagnostics)
    }

    #[test]
    fn cutoff_is_horizon_behind_now() {
        assert_eq!(policy().cutoff(1_000), 400);
    }

    #[tokio::test]
    async fn sweep_removes_only_buckets_past_horizon() {
        let (sweeper, backend, diagnostics) = sweeper(1_000);
        let key = SeriesKey::System(SystemMetric::CpuPercent);
        let buckets: Vec<Bucket> = [300, 360, 420, 900]
            .into_iter()
            .map(|ws| Bucket::single(key.clone(), ws, 60, 1.0, None))
            .collect();
        backend.upsert_batch(&buckets, BatchId::new()).await.unwrap();

        assert_eq!(sweeper.sweep_once().await.unwrap(), 2);
        let starts: Vec<i64> = backend
            .query(&key, 0, 2_000)
            .await
            .unwrap()
            .iter()
            .map(|b| b.window_start)
            .collect();
        assert_eq!(starts, vec![420, 900]);
        assert_eq!(diagnostics.snapshot().sweeps_completed, 1);
    }

    #[tokio::test]
    async fn failing_series_does_not_stop_the_others() {
        let cpu = SeriesKey::System(SystemMetric::CpuPercent);
        let memory = SeriesKey::System(SystemMetric::MemoryPercent);
        let sent = SeriesKey::System(SystemMetric::NetworkIoSent);

        let store = SqliteBackend::open_in_memory(Arc::new(Diagnostics::new())).unwrap();
        store
            .lock_connection()
            .execute_batch(&format!(
                "CREATE TRIGGER pin_series BEFORE DELETE ON buckets \
                 WHEN old.series_key = '{memory}' \
                 BEGIN SELECT RAISE(ABORT, 'series locked'); END;"
            ))
            .unwrap();
        let (sweeper, backend, diagnostics) = sweeper_over(1_000, Store::File(store));

        let buckets: Vec<Bucket> = [&cpu, &memory, &sent]
            .into_iter()
            .flat_map(|key| {
                [300, 900].map(|ws| Bucket::single((*key).clone(), ws, 60, 1.0, None))
            })
            .collect();
        backend.upsert_batch(&buckets, BatchId::new()).await.unwrap();

        let err = sweeper.sweep_once().await.unwrap_err();
        assert!(matches!(
            err,
            MetricsError::RetentionSweepPartialFailure { failed: 1, total: 3 }
        ));
        for key in [&cpu, &sent] {
            let starts: Vec<i64> = backend
                .query(key, 0, 2_000)
                .await
                .unwrap()
                .iter()
                .map(|b| b.window_start)
                .collect();
            assert_eq!(starts, vec![900], "{key}");
        }
        assert_eq!(backend.query(&memory, 0, 2_000).await.unwrap().len(), 2);
        let snapshot = diagnostics.snapshot();
        assert_eq!(snapshot.sweep_failures, 1);
        assert_eq!(snapshot.sweeps_completed, 0);
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let (sweeper, _, _) = sweeper(1_000);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(sweeper.run(Duration::from_secs(3_600), rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
