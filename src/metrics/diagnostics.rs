//! Counters describing what the engine dropped, retried, or skipped.
//!
//! Everything here is an `AtomicU64` bumped with `Ordering::Relaxed`; no
//! cross-field ordering is needed, only eventual consistency for the
//! diagnostics endpoint.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Diagnostics {
    samples_ingested: AtomicU64,
    dropped_late_sample: AtomicU64,
    dropped_invalid_sample: AtomicU64,
    dropped_lock_timeout: AtomicU64,
    dropped_flush: AtomicU64,
    flush_retries: AtomicU64,
    buckets_flushed: AtomicU64,
    backend_corrupt: AtomicU64,
    sweep_failures: AtomicU64,
    sweeps_completed: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub samples_ingested: u64,
    pub dropped_late_sample: u64,
    pub dropped_invalid_sample: u64,
    pub dropped_lock_timeout: u64,
    pub dropped_flush: u64,
    pub flush_retries: u64,
    pub buckets_flushed: u64,
    pub backend_corrupt: u64,
    pub sweep_failures: u64,
    pub sweeps_completed: u64,
}

fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample_ingested(&self) {
        bump(&self.samples_ingested, 1);
    }

    pub fn late_sample_dropped(&self) {
        bump(&self.dropped_late_sample, 1);
    }

    pub fn invalid_sample_dropped(&self) {
        bump(&self.dropped_invalid_sample, 1);
    }

    pub fn lock_timeout(&self) {
        bump(&self.dropped_lock_timeout, 1);
    }

    pub fn flushes_dropped(&self, n: u64) {
        bump(&self.dropped_flush, n);
    }

    pub fn flush_retried(&self) {
        bump(&self.flush_retries, 1);
    }

    pub fn buckets_flushed(&self, n: u64) {
        bump(&self.buckets_flushed, n);
    }

    pub fn corrupt_bucket(&self) {
        bump(&self.backend_corrupt, 1);
    }

    pub fn sweep_failed(&self) {
        bump(&self.sweep_failures, 1);
    }

    pub fn sweep_completed(&self) {
        bump(&self.sweeps_completed, 1);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        DiagnosticsSnapshot {
            samples_ingested: load(&self.samples_ingested),
            dropped_late_sample: load(&self.dropped_late_sample),
            dropped_invalid_sample: load(&self.dropped_invalid_sample),
            dropped_lock_timeout: load(&self.dropped_lock_timeout),
            dropped_flush: load(&self.dropped_flush),
            flush_retries: load(&self.flush_retries),
            buckets_flushed: load(&self.buckets_flushed),
            backend_corrupt: load(&self.backend_corrupt),
            sweep_failures: load(&self.sweep_failures),
            sweeps_completed: load(&self.sweeps_completed),
        }
    }
}
