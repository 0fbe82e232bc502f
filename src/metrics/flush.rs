use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use super::{Bucket, Diagnostics, SeriesKey};
use crate::backend::{Backend, BatchId};
use crate::error::MetricsError;

// ─── Queue ───────────────────────────────────────────────────────

/// Bounded hand-off between the request path and backend I/O.
///
/// `push` never waits: when full, the oldest pending bucket is dropped so
/// live traffic is never slowed down by storage.
pub struct FlushQueue {
    pending: Mutex<VecDeque<Bucket>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    /// Buckets handed to a worker and not yet written or dropped
    in_flight: AtomicUsize,
    diagnostics: Arc<Diagnostics>,
}

impl FlushQueue {
    pub fn new(capacity: usize, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            pending: Mutex::new(VecDeque::with_capacity(capacity.min(4_096))),
            capacity: capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            diagnostics,
        }
    }

    /// Enqueue a finalized (or late) bucket. `bucket` itself is always
    /// accepted while the queue is open; `Err(QueueFull)` reports that the
    /// oldest pending bucket was dropped to make room for it.
    pub fn push(&self, bucket: Bucket) -> Result<(), MetricsError> {
        if self.closed.load(Ordering::Acquire) {
            debug!(series = %bucket.series_key, "flush queue closed, bucket dropped");
            self.diagnostics.flushes_dropped(1);
            return Ok(());
        }

        let displaced = {
            let mut pending = self.pending.lock();
            let displaced = if pending.len() >= self.capacity {
                pending.pop_front()
            } else {
                None
            };
            pending.push_back(bucket);
            displaced
        };
        self.notify.notify_one();

        match displaced {
            Some(old) => {
                debug!(
                    series = %old.series_key,
                    window_start = old.window_start,
                    "oldest pending flush dropped"
                );
                self.diagnostics.flushes_dropped(1);
                Err(MetricsError::QueueFull)
            }
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for up to `max` buckets. `None` once closed and fully drained.
    pub async fn next_batch(&self, max: usize) -> Option<Vec<Bucket>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut pending = self.pending.lock();
                if !pending.is_empty() {
                    let n = pending.len().min(max.max(1));
                    let batch: Vec<Bucket> = pending.drain(..n).collect();
                    self.in_flight.fetch_add(batch.len(), Ordering::AcqRel);
                    if !pending.is_empty() {
                        // Let a sibling worker pick up the rest
                        self.notify.notify_one();
                    }
                    return Some(batch);
                }
            }

            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Copies of pending buckets of `key` with `window_start` in range, so
    /// readers do not miss windows that are finalized but not yet written.
    pub fn pending_for(&self, key: &SeriesKey, ts_from: i64, ts_to: i64) -> Vec<Bucket> {
        self.pending
            .lock()
            .iter()
            .filter(|b| {
                &b.series_key == key && b.window_start >= ts_from && b.window_start <= ts_to
            })
            .cloned()
            .collect()
    }

    /// Called by a worker once a batch from [`Self::next_batch`] is settled.
    pub fn complete(&self, n: usize) {
        self.in_flight.fetch_sub(n, Ordering::AcqRel);
    }

    /// Nothing pending and nothing being written.
    pub fn is_idle(&self) -> bool {
        let pending = self.pending.lock();
        pending.is_empty() && self.in_flight.load(Ordering::Acquire) == 0
    }

    /// Stop accepting work; workers exit once the backlog is drained.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Forget pending work without counting it as dropped (used by reset).
    pub fn clear(&self) {
        self.pending.lock().clear();
    }

    /// Drop whatever is still pending and count it.
    pub fn discard_pending(&self) -> usize {
        let n = {
            let mut pending = self.pending.lock();
            let n = pending.len();
            pending.clear();
            n
        };
        if n > 0 {
            self.diagnostics.flushes_dropped(n as u64);
        }
        n
    }
}

// ─── Retry policy ────────────────────────────────────────────────

/// Bounded exponential backoff for transient backend failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

// ─── Worker ──────────────────────────────────────────────────────

/// Drains the flush queue into the backend in batches.
pub struct FlushWorker {
    pub id: usize,
    pub queue: Arc<FlushQueue>,
    pub backend: Arc<Backend>,
    pub diagnostics: Arc<Diagnostics>,
    pub retry: RetryPolicy,
    pub batch_size: usize,
}

impl FlushWorker {
    pub async fn run(self) {
        while let Some(batch) = self.queue.next_batch(self.batch_size).await {
            let n = batch.len();
            self.write(batch).await;
            self.queue.complete(n);
        }
        debug!(worker = self.id, "flush worker exiting");
    }

    /// Every attempt reuses one [`BatchId`], so a retry after a timeout
    /// never merges a bucket the backend already applied.
    async fn write(&self, batch: Vec<Bucket>) {
        let n = batch.len() as u64;
        let batch_id = BatchId::new();
        let mut attempt = 0;
        loop {
            match self.backend.upsert_batch(&batch, batch_id).await {
                Ok(()) => {
                    self.diagnostics.buckets_flushed(n);
                    return;
                }
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        worker = self.id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "flush failed, retrying"
                    );
                    self.diagnostics.flush_retried();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(worker = self.id, buckets = n, error = %e, "flush dropped");
                    self.diagnostics.flushes_dropped(n);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SqliteBackend, Store};
    use crate::metrics::SystemMetric;

    fn cpu() -> SeriesKey {
        SeriesKey::System(SystemMetric::CpuPercent)
    }

    fn bucket(ws: i64) -> Bucket {
        Bucket::single(cpu(), ws, 10, 1.0, None)
    }

    fn worker(
        queue: Arc<FlushQueue>,
        backend: Arc<Backend>,
        diagnostics: Arc<Diagnostics>,
        retry: RetryPolicy,
    ) -> FlushWorker {
        FlushWorker {
            id: 0,
            queue,
            backend,
            diagnostics,
            retry,
            batch_size: 8,
        }
    }

    #[test]
    fn full_queue_drops_oldest_not_newest() {
        let diagnostics = Arc::new(Diagnostics::new());
        let queue = FlushQueue::new(2, diagnostics.clone());
        queue.push(bucket(0)).unwrap();
        queue.push(bucket(10)).unwrap();
        assert!(matches!(queue.push(bucket(20)), Err(MetricsError::QueueFull)));

        assert_eq!(queue.len(), 2);
        assert_eq!(diagnostics.snapshot().dropped_flush, 1);
        let pending: Vec<i64> = queue.pending.lock().iter().map(|b| b.window_start).collect();
        assert_eq!(pending, vec![10, 20]);
    }

    #[tokio::test]
    async fn batches_respect_max_and_close_ends_stream() {
        let queue = FlushQueue::new(16, Arc::new(Diagnostics::new()));
        for ws in 0..5 {
            queue.push(bucket(ws * 10)).unwrap();
        }
        assert_eq!(queue.next_batch(3).await.unwrap().len(), 3);
        assert!(!queue.is_idle());
        queue.complete(3);
        queue.close();
        assert_eq!(queue.next_batch(3).await.unwrap().len(), 2);
        assert!(queue.next_batch(3).await.is_none());
    }

    #[tokio::test]
    async fn waiting_worker_wakes_on_push() {
        let queue = Arc::new(FlushQueue::new(4, Arc::new(Diagnostics::new())));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next_batch(8).await })
        };
        tokio::task::yield_now().await;
        queue.push(bucket(0)).unwrap();
        let batch = waiter.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn push_after_close_is_counted() {
        let diagnostics = Arc::new(Diagnostics::new());
        let queue = FlushQueue::new(4, diagnostics.clone());
        queue.close();
        assert!(queue.push(bucket(0)).is_ok());
        assert!(queue.is_empty());
        assert_eq!(diagnostics.snapshot().dropped_flush, 1);
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = RetryPolicy {
            max_retries: 5,
            base: Duration::from_millis(50),
            cap: Duration::from_millis(300),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(50));
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(300));
        assert_eq!(policy.delay(40), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn write_that_timed_out_is_retried_without_double_counting() {
        let dir = tempfile::tempdir().unwrap();
        let diagnostics = Arc::new(Diagnostics::new());
        let store = SqliteBackend::open(&dir.path().join("metrics.db"), diagnostics.clone())
            .unwrap()
            .with_lock_wait(Duration::from_millis(50))
            .unwrap();
        let backend = Arc::new(Backend::new(
            Store::File(store.clone()),
            Duration::from_millis(50),
        ));

        // Another writer holds the connection three times longer than a call may wait
        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            let _conn = store.lock_connection();
            held_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(150));
        });
        held_rx.recv().unwrap();

        let queue = Arc::new(FlushQueue::new(8, diagnostics.clone()));
        queue.push(bucket(0)).unwrap();
        queue.close();
        let retry = RetryPolicy {
            max_retries: 8,
            base: Duration::from_millis(50),
            cap: Duration::from_millis(100),
        };
        worker(queue.clone(), backend.clone(), diagnostics.clone(), retry)
            .run()
            .await;
        holder.join().unwrap();

        let stored = backend.query(&cpu(), 0, 0).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].count, 1);
        let snapshot = diagnostics.snapshot();
        assert!(snapshot.flush_retries >= 1);
        assert_eq!(snapshot.buckets_flushed, 1);
        assert_eq!(snapshot.dropped_flush, 0);
        assert!(queue.is_idle());
    }

    #[tokio::test]
    async fn persistent_failure_is_retried_then_dropped() {
        let diagnostics = Arc::new(Diagnostics::new());
        let store = SqliteBackend::open_in_memory(diagnostics.clone()).unwrap();
        store
            .lock_connection()
            .execute_batch(
                "CREATE TRIGGER refuse_writes BEFORE INSERT ON buckets \
                 BEGIN SELECT RAISE(ABORT, 'disk unavailable'); END;",
            )
            .unwrap();
        let backend = Arc::new(Backend::new(Store::File(store), Duration::from_secs(1)));

        let queue = Arc::new(FlushQueue::new(8, diagnostics.clone()));
        queue.push(bucket(0)).unwrap();
        queue.push(bucket(10)).unwrap();
        queue.close();
        let retry = RetryPolicy {
            max_retries: 3,
            base: Duration::from_millis(1),
            cap: Duration::from_millis(4),
        };
        worker(queue.clone(), backend.clone(), diagnostics.clone(), retry)
            .run()
            .await;

        let snapshot = diagnostics.snapshot();
        assert_eq!(snapshot.flush_retries, 3);
        assert_eq!(snapshot.dropped_flush, 2);
        assert_eq!(snapshot.buckets_flushed, 0);
        assert!(queue.is_idle());
        assert!(backend.query(&cpu(), 0, 100).await.unwrap().is_empty());
    }
}
