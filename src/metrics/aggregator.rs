use super::{Bucket, SeriesKey, StatusClass};

/// What happened to a value handed to [`SeriesAggregator::record`].
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    /// Folded into the open bucket
    Folded,
    /// Opened a newer window; the previous bucket is finalized and must be
    /// handed to the backend
    Rolled(Bucket),
    /// Belongs to a window older than the open one; the single-value bucket
    /// must be upserted into the historical window
    Late(Bucket),
}

/// Owns the open bucket of one series and rolls it over as time advances.
///
/// Not synchronized on its own; the ingestion gateway wraps each aggregator
/// in its own mutex.
#[derive(Debug)]
pub struct SeriesAggregator {
    key: SeriesKey,
    window_size: i64,
    open: Option<Bucket>,
}

impl SeriesAggregator {
    pub fn new(key: SeriesKey, window_size: i64) -> Self {
        Self {
            key,
            window_size,
            open: None,
        }
    }

    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    /// Bucket the value into its window, or roll over.
    pub fn record(&mut self, ts: i64, value: f64, status: Option<StatusClass>) -> Recorded {
        let window_start = Bucket::window_start_for(ts, self.window_size);

        match &mut self.open {
            // Same window: accumulate
            Some(bucket) if bucket.window_start == window_start => {
                bucket.fold(value, status);
                Recorded::Folded
            }
            // Out of order: goes straight to the historical window
            Some(bucket) if window_start < bucket.window_start => Recorded::Late(Bucket::single(
                self.key.clone(),
                window_start,
                self.window_size,
                value,
                status,
            )),
            // Newer window: finalize the old one, start fresh
            Some(_) => {
                let fresh =
                    Bucket::single(self.key.clone(), window_start, self.window_size, value, status);
                match self.open.replace(fresh) {
                    Some(old) if !old.is_empty() => Recorded::Rolled(old),
                    _ => Recorded::Folded,
                }
            }
            // Very first value
            None => {
                self.open = Some(Bucket::single(
                    self.key.clone(),
                    window_start,
                    self.window_size,
                    value,
                    status,
                ));
                Recorded::Folded
            }
        }
    }

    /// Hand over the open bucket. A second call returns `None`, so the same
    /// fold is never flushed twice.
    pub fn flush(&mut self) -> Option<Bucket> {
        self.open.take().filter(|b| !b.is_empty())
    }

    /// Flush only if the open window has ended.
    pub fn flush_if_closed(&mut self, now: i64) -> Option<Bucket> {
        match &self.open {
            Some(bucket) if bucket.is_closed(now) => self.flush(),
            _ => None,
        }
    }

    /// Copy of the open bucket, for readers.
    pub fn snapshot(&self) -> Option<Bucket> {
        self.open.clone().filter(|b| !b.is_empty())
    }

    /// Drop the open bucket if it starts before `cutoff`. Returns whether
    /// anything was evicted.
    pub fn evict_before(&mut self, cutoff: i64) -> bool {
        if matches!(&self.open, Some(b) if b.window_start < cutoff) {
            self.open = None;
            return true;
        }
        false
    }

    pub fn is_idle(&self) -> bool {
        self.open.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::SystemMetric;

    fn aggregator() -> SeriesAggregator {
        SeriesAggregator::new(SeriesKey::System(SystemMetric::CpuPercent), 60)
    }

    #[test]
    fn values_in_one_window_accumulate() {
        let mut agg = aggregator();
        assert_eq!(agg.record(0, 10.0, None), Recorded::Folded);
        assert_eq!(agg.record(59, 30.0, None), Recorded::Folded);

        let open = agg.snapshot().unwrap();
        assert_eq!((open.count, open.min, open.max), (2, 10.0, 30.0));
        assert_eq!(open.window_start, 0);
    }

    #[test]
    fn crossing_a_boundary_finalizes_previous_window() {
        let mut agg = aggregator();
        agg.record(10, 1.0, None);
        match agg.record(65, 2.0, None) {
            Recorded::Rolled(old) => {
                assert_eq!(old.window_start, 0);
                assert_eq!(old.count, 1);
            }
            other => panic!("expected roll-over, got {other:?}"),
        }
        assert_eq!(agg.snapshot().unwrap().window_start, 60);
    }

    #[test]
    fn older_window_is_reported_late() {
        let mut agg = aggregator();
        agg.record(130, 1.0, None);
        match agg.record(20, 5.0, None) {
            Recorded::Late(bucket) => {
                assert_eq!(bucket.window_start, 0);
                assert_eq!(bucket.sum, 5.0);
            }
            other => panic!("expected late bucket, got {other:?}"),
        }
        // Open window untouched
        assert_eq!(agg.snapshot().unwrap().count, 1);
    }

    #[test]
    fn flush_is_idempotent() {
        let mut agg = aggregator();
        agg.record(0, 1.0, None);
        assert!(agg.flush().is_some());
        assert!(agg.flush().is_none());
        assert!(agg.is_idle());
    }

    #[test]
    fn flush_if_closed_waits_for_window_end() {
        let mut agg = aggregator();
        agg.record(0, 1.0, None);
        assert!(agg.flush_if_closed(59).is_none());
        assert!(agg.flush_if_closed(60).is_some());
    }

    #[test]
    fn eviction_only_hits_stale_windows() {
        let mut agg = aggregator();
        agg.record(120, 1.0, None);
        assert!(!agg.evict_before(120));
        assert!(agg.evict_before(121));
        assert!(agg.is_idle());
    }
}
