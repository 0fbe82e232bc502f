use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{SeriesKey, StatusClass};

/// Per-class request counters of one bucket, serialized as `{"2XX": 3, ...}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCounts(BTreeMap<StatusClass, u64>);

impl StatusCounts {
    pub fn increment(&mut self, class: StatusClass) {
        self.add(class, 1);
    }

    pub fn add(&mut self, class: StatusClass, n: u64) {
        if n > 0 {
            *self.0.entry(class).or_insert(0) += n;
        }
    }

    pub fn get(&self, class: StatusClass) -> u64 {
        self.0.get(&class).copied().unwrap_or(0)
    }

    pub fn merge(&mut self, other: &StatusCounts) {
        for (class, n) in &other.0 {
            self.add(*class, *n);
        }
    }

    /// 4XX + 5XX
    pub fn errors(&self) -> u64 {
        self.get(StatusClass::ClientError) + self.get(StatusClass::ServerError)
    }

    pub fn iter(&self) -> impl Iterator<Item = (StatusClass, u64)> + '_ {
        self.0.iter().map(|(class, n)| (*class, *n))
    }
}

/// Fixed-duration aggregation cell for one series.
///
/// Only `count/sum/min/max` (plus status classes) are kept; raw samples and
/// percentiles are never recoverable. A bucket with `count == 0` carries no
/// meaningful `min`/`max` and readers treat it as absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub series_key: SeriesKey,
    /// Epoch seconds, always a multiple of `window_size`
    pub window_start: i64,
    /// Seconds
    pub window_size: i64,
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    #[serde(default)]
    pub status_code_counts: StatusCounts,
}

impl Bucket {
    /// `floor(ts / size) * size`, also for timestamps before the epoch.
    pub fn window_start_for(ts: i64, window_size: i64) -> i64 {
        ts.div_euclid(window_size) * window_size
    }

    pub fn empty(series_key: SeriesKey, window_start: i64, window_size: i64) -> Self {
        Self {
            series_key,
            window_start,
            window_size,
            count: 0,
            sum: 0.0,
            min: 0.0,
            max: 0.0,
            status_code_counts: StatusCounts::default(),
        }
    }

    /// A bucket holding exactly one value.
    pub fn single(
        series_key: SeriesKey,
        window_start: i64,
        window_size: i64,
        value: f64,
        status: Option<StatusClass>,
    ) -> Self {
        let mut bucket = Self::empty(series_key, window_start, window_size);
        bucket.fold(value, status);
        bucket
    }

    /// Fold one value in place.
    pub fn fold(&mut self, value: f64, status: Option<StatusClass>) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
        if let Some(class) = status {
            self.status_code_counts.increment(class);
        }
    }

    /// Numerically combine another partial fold of the same window.
    ///
    /// Commutative and associative, so two partial folds combine to the same
    /// result as one fold over all the values.
    pub fn merge(&mut self, other: &Bucket) {
        debug_assert_eq!(self.window_start, other.window_start);
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            self.min = other.min;
            self.max = other.max;
        } else {
            self.min = self.min.min(other.min);
            self.max = self.max.max(other.max);
        }
        self.count += other.count;
        self.sum += other.sum;
        self.status_code_counts.merge(&other.status_code_counts);
    }

    /// Same statistics, re-keyed onto the coarser window containing this one.
    /// Only used to build display resolutions; never persisted.
    pub fn realigned(&self, window_size: i64) -> Bucket {
        Bucket {
            window_start: Self::window_start_for(self.window_start, window_size),
            window_size,
            ..self.clone()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn avg(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn window_end(&self) -> i64 {
        self.window_start + self.window_size
    }

    /// Once closed, only the retention sweeper may touch the bucket.
    pub fn is_closed(&self, now: i64) -> bool {
        now >= self.window_end()
    }

    /// Sanity check applied to buckets read back from storage.
    pub fn is_consistent(&self) -> bool {
        if self.window_size <= 0 || self.window_start.rem_euclid(self.window_size) != 0 {
            return false;
        }
        if self.count == 0 {
            return true;
        }
        if !(self.sum.is_finite() && self.min.is_finite() && self.max.is_finite()) {
            return false;
        }
        let avg = self.sum / self.count as f64;
        let slack = 1e-9 * avg.abs().max(1.0);
        self.min <= avg + slack && avg <= self.max + slack
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::RequestMetric;
    use proptest::prelude::*;

    fn key() -> SeriesKey {
        SeriesKey::request("/orders", RequestMetric::Latency)
    }

    #[test]
    fn two_samples_in_one_window() {
        let mut bucket = Bucket::empty(key(), 0, 60);
        bucket.fold(0.1, StatusClass::from_code(200));
        bucket.fold(0.3, StatusClass::from_code(500));

        assert_eq!(bucket.count, 2);
        assert!((bucket.sum - 0.4).abs() < 1e-12);
        assert_eq!(bucket.min, 0.1);
        assert_eq!(bucket.max, 0.3);
        assert_eq!(bucket.status_code_counts.get(StatusClass::Success), 1);
        assert_eq!(bucket.status_code_counts.get(StatusClass::ServerError), 1);
        assert_eq!(bucket.status_code_counts.errors(), 1);
    }

    #[test]
    fn empty_bucket_has_no_average() {
        let bucket = Bucket::empty(key(), 60, 60);
        assert!(bucket.avg().is_none());
        assert!(bucket.is_consistent());
    }

    #[test]
    fn merging_into_empty_takes_other_extremes() {
        let mut target = Bucket::empty(key(), 0, 60);
        let other = Bucket::single(key(), 0, 60, 7.0, None);
        target.merge(&other);
        assert_eq!((target.count, target.min, target.max), (1, 7.0, 7.0));

        // Empty on the right is a no-op
        target.merge(&Bucket::empty(key(), 0, 60));
        assert_eq!(target.count, 1);
    }

    #[test]
    fn window_alignment_floors() {
        assert_eq!(Bucket::window_start_for(59, 60), 0);
        assert_eq!(Bucket::window_start_for(60, 60), 60);
        assert_eq!(Bucket::window_start_for(-1, 60), -60);
    }

    #[test]
    fn status_counts_serialize_as_class_map() {
        let bucket = Bucket::single(key(), 0, 60, 1.0, Some(StatusClass::ClientError));
        let json = serde_json::to_value(&bucket).unwrap();
        assert_eq!(json["status_code_counts"]["4XX"], 1);
        assert_eq!(json["series_key"], "request:latency:/orders");
        let back: Bucket = serde_json::from_value(json).unwrap();
        assert_eq!(back, bucket);
    }

    #[test]
    fn inconsistent_extremes_are_detected() {
        let mut bucket = Bucket::single(key(), 0, 60, 1.0, None);
        bucket.min = 5.0;
        assert!(!bucket.is_consistent());

        let misaligned = Bucket::empty(key(), 7, 60);
        assert!(!misaligned.is_consistent());
    }

    fn fold_all(values: &[(f64, Option<u16>)]) -> Bucket {
        let mut bucket = Bucket::empty(key(), 0, 60);
        for (v, code) in values {
            bucket.fold(*v, code.and_then(StatusClass::from_code));
        }
        bucket
    }

    fn value_strategy() -> impl Strategy<Value = Vec<(f64, Option<u16>)>> {
        prop::collection::vec((0.0f64..100.0, prop::option::of(100u16..600)), 0..40)
    }

    proptest! {
        #[test]
        fn fold_tracks_exact_statistics(values in value_strategy()) {
            let bucket = fold_all(&values);
            prop_assert_eq!(bucket.count as usize, values.len());
            let sum: f64 = values.iter().map(|(v, _)| v).sum();
            prop_assert!((bucket.sum - sum).abs() < 1e-6);
            if !values.is_empty() {
                let min = values.iter().map(|(v, _)| *v).fold(f64::INFINITY, f64::min);
                let max = values.iter().map(|(v, _)| *v).fold(f64::NEG_INFINITY, f64::max);
                prop_assert_eq!(bucket.min, min);
                prop_assert_eq!(bucket.max, max);
            }
            prop_assert!(bucket.is_consistent());
        }

        #[test]
        fn merge_matches_single_fold(left in value_strategy(), right in value_strategy()) {
            let mut merged = fold_all(&left);
            merged.merge(&fold_all(&right));

            let mut reversed = fold_all(&right);
            reversed.merge(&fold_all(&left));

            let whole: Vec<_> = left.iter().chain(right.iter()).cloned().collect();
            let expected = fold_all(&whole);

            for candidate in [&merged, &reversed] {
                prop_assert_eq!(candidate.count, expected.count);
                prop_assert!((candidate.sum - expected.sum).abs() < 1e-6);
                prop_assert_eq!(candidate.min, expected.min);
                prop_assert_eq!(candidate.max, expected.max);
                prop_assert_eq!(&candidate.status_code_counts, &expected.status_code_counts);
            }
        }
    }
}
