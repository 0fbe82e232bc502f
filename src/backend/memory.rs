use dashmap::DashMap;

use crate::metrics::retention::RetentionPolicy;
use crate::metrics::{Bucket, SeriesKey};

/// Bounded ring of buckets per series, `horizon / window_size + 1` slots.
///
/// A window maps to slot `(window_start / window_size) mod slots`, so upsert
/// and point lookups are index arithmetic. A newer window landing on an
/// occupied slot evicts the older one; an older window landing on a newer
/// one is discarded. Nothing survives a restart.
pub struct MemoryBackend {
    window_size: i64,
    slots: usize,
    series: DashMap<SeriesKey, Ring>,
}

struct Ring {
    slots: Vec<Option<Bucket>>,
}

impl Ring {
    fn new(slots: usize) -> Self {
        Self {
            slots: vec![None; slots],
        }
    }

    fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    fn evict_before(&mut self, cutoff: i64) -> u64 {
        let mut removed = 0;
        for slot in self.slots.iter_mut() {
            if matches!(slot, Some(b) if b.window_start < cutoff) {
                *slot = None;
                removed += 1;
            }
        }
        removed
    }
}

impl MemoryBackend {
    pub fn new(policy: RetentionPolicy) -> Self {
        let window_size = policy.window_size_secs.max(1);
        let slots = (policy.horizon_secs / window_size).max(1) as usize + 1;
        Self {
            window_size,
            slots,
            series: DashMap::new(),
        }
    }

    pub fn capacity_per_series(&self) -> usize {
        self.slots
    }

    fn slot_index(&self, window_start: i64) -> usize {
        window_start
            .div_euclid(self.window_size)
            .rem_euclid(self.slots as i64) as usize
    }

    pub fn upsert(&self, bucket: &Bucket) {
        if bucket.is_empty() {
            return;
        }
        let idx = self.slot_index(bucket.window_start);
        let mut ring = self
            .series
            .entry(bucket.series_key.clone())
            .or_insert_with(|| Ring::new(self.slots));

        let slot = &mut ring.slots[idx];
        match slot {
            Some(existing) if existing.window_start == bucket.window_start => {
                existing.merge(bucket)
            }
            Some(existing) if existing.window_start > bucket.window_start => {
                // Older than anything the ring still holds for this slot
            }
            _ => *slot = Some(bucket.clone()),
        }
    }

    pub fn query(&self, key: &SeriesKey, ts_from: i64, ts_to: i64) -> Vec<Bucket> {
        let Some(ring) = self.series.get(key) else {
            return Vec::new();
        };
        let mut out: Vec<Bucket> = ring
            .slots
            .iter()
            .flatten()
            .filter(|b| b.window_start >= ts_from && b.window_start <= ts_to)
            .cloned()
            .collect();
        out.sort_by_key(|b| b.window_start);
        out
    }

    pub fn delete_before(&self, prefix: &str, cutoff: i64) -> u64 {
        let mut removed = 0;
        self.series.retain(|key, ring| {
            if key.to_string().starts_with(prefix) {
                removed += ring.evict_before(cutoff);
            }
            !ring.is_empty()
        });
        removed
    }

    pub fn list_series_keys(&self, prefix: &str) -> Vec<SeriesKey> {
        let mut keys: Vec<SeriesKey> = self
            .series
            .iter()
            .filter(|entry| entry.key().to_string().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn reset(&self) {
        self.series.clear();
    }
}
