use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::aggregator::{Recorded, SeriesAggregator};
use super::flush::FlushQueue;
use super::{Bucket, Diagnostics, Sample, SeriesKey};
use crate::clock::Clock;
use crate::error::MetricsError;

/// Single entry point for producers.
///
/// Each series key owns one aggregator behind its own mutex; the map only
/// hands out `Arc`s, so unrelated keys never contend. Nothing here performs
/// I/O: finalized and late buckets go to the flush queue.
pub struct IngestionGateway {
    series: DashMap<SeriesKey, Arc<Mutex<SeriesAggregator>>>,
    queue: Arc<FlushQueue>,
    diagnostics: Arc<Diagnostics>,
    clock: Arc<dyn Clock>,
    window_size: i64,
    grace: i64,
    lock_wait: Duration,
}

impl IngestionGateway {
    pub fn new(
        queue: Arc<FlushQueue>,
        diagnostics: Arc<Diagnostics>,
        clock: Arc<dyn Clock>,
        window_size_secs: i64,
        grace_secs: i64,
        lock_wait: Duration,
    ) -> Self {
        Self {
            series: DashMap::new(),
            queue,
            diagnostics,
            clock,
            window_size: window_size_secs.max(1),
            grace: grace_secs.max(0),
            lock_wait,
        }
    }

    pub fn window_size(&self) -> i64 {
        self.window_size
    }

    /// Fold one sample into its series. Never fails and never waits longer
    /// than the configured lock wait per series; every reason a sample (or
    /// part of it) is not recorded ends up in [`Diagnostics`].
    pub fn ingest(&self, sample: Sample) {
        if let Err(err) = sample.validate() {
            debug!(error = %err, "sample dropped");
            self.diagnostics.invalid_sample_dropped();
            return;
        }

        let ts = sample.timestamp.timestamp();
        let age = self.clock.now_secs() - ts;
        // A window opened in the future would turn every on-time sample late
        if -age > self.window_size {
            let err = MetricsError::InvalidSample(format!("timestamp {}s in the future", -age));
            debug!(error = %err, "sample dropped");
            self.diagnostics.invalid_sample_dropped();
            return;
        }
        if age > self.grace {
            debug!(age_secs = age, grace_secs = self.grace, "late sample dropped");
            self.diagnostics.late_sample_dropped();
            return;
        }

        for obs in sample.observations() {
            let aggregator = self.aggregator(&obs.key);
            let Some(mut guard) = aggregator.try_lock_for(self.lock_wait) else {
                debug!(series = %obs.key, "series lock wait exceeded");
                self.diagnostics.lock_timeout();
                continue;
            };
            let recorded = guard.record(ts, obs.value, obs.status);
            drop(guard);

            match recorded {
                Recorded::Folded => {}
                Recorded::Rolled(bucket) | Recorded::Late(bucket) => self.enqueue(bucket),
            }
        }
        self.diagnostics.sample_ingested();
    }

    fn enqueue(&self, bucket: Bucket) {
        if let Err(err) = self.queue.push(bucket) {
            debug!(error = %err, "flush backlog trimmed");
        }
    }

    fn aggregator(&self, key: &SeriesKey) -> Arc<Mutex<SeriesAggregator>> {
        if let Some(existing) = self.series.get(key) {
            return existing.clone();
        }
        self.series
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(SeriesAggregator::new(key.clone(), self.window_size)))
            })
            .clone()
    }

    fn aggregators(&self) -> Vec<Arc<Mutex<SeriesAggregator>>> {
        self.series.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Hand every open bucket whose window has ended to the flush queue.
    pub fn flush_expired(&self, now: i64) -> usize {
        let mut flushed = 0;
        for aggregator in self.aggregators() {
            let bucket = aggregator.lock().flush_if_closed(now);
            if let Some(bucket) = bucket {
                self.enqueue(bucket);
                flushed += 1;
            }
        }
        flushed
    }

    /// Hand every open bucket to the flush queue, closed or not.
    pub fn flush_all(&self) -> usize {
        let mut flushed = 0;
        for aggregator in self.aggregators() {
            let bucket = aggregator.lock().flush();
            if let Some(bucket) = bucket {
                self.enqueue(bucket);
                flushed += 1;
            }
        }
        flushed
    }

    /// The open bucket of `key`, read under the same lock writers take.
    pub fn snapshot(&self, key: &SeriesKey) -> Option<Bucket> {
        let aggregator = self.series.get(key).map(|entry| entry.value().clone())?;
        let bucket = aggregator.lock().snapshot();
        bucket
    }

    /// Buckets of `key` in range that are not yet handed to a flush worker:
    /// queued ones first, then the open one.
    ///
    /// The queue is read before the open bucket. A bucket that moves from
    /// open to queued between the two reads is missed by this call rather
    /// than returned twice.
    pub fn unpersisted(&self, key: &SeriesKey, ts_from: i64, ts_to: i64) -> Vec<Bucket> {
        let mut buckets = self.queue.pending_for(key, ts_from, ts_to);
        if let Some(open) = self.snapshot(key) {
            if open.window_start >= ts_from && open.window_start <= ts_to {
                buckets.push(open);
            }
        }
        buckets
    }

    /// Keys with a live aggregator whose text form starts with `prefix`.
    pub fn series_keys(&self, prefix: &str) -> Vec<SeriesKey> {
        let mut keys: Vec<SeriesKey> = self
            .series
            .iter()
            .filter(|entry| entry.key().to_string().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Evict open buckets older than `cutoff` and forget idle series.
    /// Returns how many open buckets were evicted.
    pub fn evict_before(&self, cutoff: i64) -> usize {
        let mut evicted = 0;
        for aggregator in self.aggregators() {
            if aggregator.lock().evict_before(cutoff) {
                evicted += 1;
            }
        }
        self.forget_idle();
        evicted
    }

    /// Discard every open bucket.
    pub fn reset(&self) {
        for aggregator in self.aggregators() {
            aggregator.lock().flush();
        }
        self.forget_idle();
    }

    // An aggregator only held by the map cannot be mid-ingest: `aggregator()`
    // clones under the same shard lock `retain` holds.
    fn forget_idle(&self) {
        self.series.retain(|_, aggregator| {
            Arc::strong_count(aggregator) > 1 || !aggregator.lock().is_idle()
        });
    }
}
