//! Read side: projections, rankings and the dashboard report.
//!
//! Every read merges what the backend has persisted with buckets still
//! waiting in the flush queue and the open bucket of the series, which is
//! copied under the series lock. Rankings and
//! projections are plain functions over buckets so they can be tested
//! without a backend.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;

use super::{
    Bucket, IngestionGateway, RequestMetric, SeriesKey, StatusClass, StatusCounts, SystemMetric,
};
use crate::backend::Backend;
use crate::error::Result;

/// Status histogram granularity (seconds).
pub const STATUS_HISTOGRAM_STEP: i64 = 60;

const HOUR: i64 = 3_600;
const DAY: i64 = 24 * HOUR;
const WEEK: i64 = 7 * DAY;

// ─── Projections ─────────────────────────────────────────────────

/// One chart point. Empty buckets never become points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SeriesPoint {
    /// Window start, epoch seconds
    pub timestamp: i64,
    pub min: f64,
    pub avg: f64,
    pub max: f64,
}

impl SeriesPoint {
    pub fn from_bucket(bucket: &Bucket) -> Option<Self> {
        Some(Self {
            timestamp: bucket.window_start,
            min: bucket.min,
            avg: bucket.avg()?,
            max: bucket.max,
        })
    }
}

pub fn project(buckets: &[Bucket]) -> Vec<SeriesPoint> {
    buckets.iter().filter_map(SeriesPoint::from_bucket).collect()
}

/// Chart resolution for a requested range: 10s up to an hour, 5min up to a
/// day, 1h up to a week, then ~200 points. Never finer than `window_size`
/// and always a multiple of it.
pub fn display_resolution(range_secs: i64, window_size: i64) -> i64 {
    let window_size = window_size.max(1);
    let preferred = match range_secs {
        r if r <= HOUR => 10,
        r if r <= DAY => 300,
        r if r <= WEEK => HOUR,
        r => HOUR.max(r / 200),
    };
    let multiples = (preferred + window_size - 1) / window_size;
    multiples.max(1) * window_size
}

/// Merge stored windows into `resolution`-sized display windows.
pub fn rebucket(buckets: &[Bucket], resolution: i64) -> Vec<Bucket> {
    let mut merged: BTreeMap<i64, Bucket> = BTreeMap::new();
    for bucket in buckets.iter().filter(|b| !b.is_empty()) {
        let coarse = bucket.realigned(resolution);
        match merged.get_mut(&coarse.window_start) {
            Some(existing) => existing.merge(&coarse),
            None => {
                merged.insert(coarse.window_start, coarse);
            }
        }
    }
    merged.into_values().collect()
}

// ─── Route totals and rankings ───────────────────────────────────

/// Latency statistics of one route summed over a range.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteTotals {
    pub route: String,
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub status: StatusCounts,
    /// Average of every non-empty bucket, in window order
    pub bucket_avgs: Vec<f64>,
    pub last_window: Option<i64>,
}

impl RouteTotals {
    pub fn from_buckets(route: &str, buckets: &[Bucket]) -> Self {
        let mut totals = Self {
            route: route.to_string(),
            count: 0,
            sum: 0.0,
            min: 0.0,
            max: 0.0,
            status: StatusCounts::default(),
            bucket_avgs: Vec::new(),
            last_window: None,
        };
        for bucket in buckets {
            let Some(avg) = bucket.avg() else { continue };
            if totals.count == 0 {
                totals.min = bucket.min;
                totals.max = bucket.max;
            } else {
                totals.min = totals.min.min(bucket.min);
                totals.max = totals.max.max(bucket.max);
            }
            totals.count += bucket.count;
            totals.sum += bucket.sum;
            totals.status.merge(&bucket.status_code_counts);
            totals.bucket_avgs.push(avg);
            totals.last_window = totals.last_window.max(Some(bucket.window_start));
        }
        totals
    }

    /// `Σsum / Σcount`, not the average of bucket averages.
    pub fn weighted_avg(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn errors(&self) -> u64 {
        self.status.errors()
    }

    pub fn error_ratio(&self) -> Option<f64> {
        (self.count > 0).then(|| self.errors() as f64 / self.count as f64)
    }

    /// Median of per-bucket averages. Buckets keep no distribution, so this
    /// is the closest thing to a median the store can answer.
    pub fn median_proxy(&self) -> Option<f64> {
        if self.bucket_avgs.is_empty() {
            return None;
        }
        let mut avgs = self.bucket_avgs.clone();
        avgs.sort_by(f64::total_cmp);
        let mid = avgs.len() / 2;
        Some(if avgs.len() % 2 == 0 {
            (avgs[mid - 1] + avgs[mid]) / 2.0
        } else {
            avgs[mid]
        })
    }
}

/// One entry of a top-N list. Lists are ordered best-first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedRoute {
    pub route: String,
    pub value: f64,
    pub count: u64,
}

fn rank(mut entries: Vec<RankedRoute>, limit: usize) -> Vec<RankedRoute> {
    entries.sort_by(|a, b| {
        b.value
            .total_cmp(&a.value)
            .then_with(|| a.route.cmp(&b.route))
    });
    entries.truncate(limit);
    entries
}

/// Most requested routes; ties go to the lexicographically smaller route.
pub fn top_by_volume(totals: &[RouteTotals], limit: usize) -> Vec<RankedRoute> {
    let entries = totals
        .iter()
        .filter(|t| t.count > 0)
        .map(|t| RankedRoute {
            route: t.route.clone(),
            value: t.count as f64,
            count: t.count,
        })
        .collect();
    rank(entries, limit)
}

/// Highest volume-weighted average latency among routes with at least
/// `min_samples` requests.
pub fn top_slowest(totals: &[RouteTotals], limit: usize, min_samples: u64) -> Vec<RankedRoute> {
    let entries = totals
        .iter()
        .filter(|t| t.count > 0 && t.count >= min_samples)
        .filter_map(|t| {
            Some(RankedRoute {
                route: t.route.clone(),
                value: t.weighted_avg()?,
                count: t.count,
            })
        })
        .collect();
    rank(entries, limit)
}

/// Highest `(4XX + 5XX) / total` among routes with at least `min_samples`
/// requests. Routes without any error are left out.
pub fn top_error_prone(totals: &[RouteTotals], limit: usize, min_samples: u64) -> Vec<RankedRoute> {
    let entries = totals
        .iter()
        .filter(|t| t.count > 0 && t.count >= min_samples && t.errors() > 0)
        .filter_map(|t| {
            Some(RankedRoute {
                route: t.route.clone(),
                value: t.error_ratio()?,
                count: t.count,
            })
        })
        .collect();
    rank(entries, limit)
}

// ─── Overview table ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverviewRow {
    pub route: String,
    pub count: u64,
    pub errors: u64,
    /// Percent
    pub error_rate: f64,
    pub avg_latency: Option<f64>,
    pub median_latency: Option<f64>,
    pub min_latency: Option<f64>,
    pub max_latency: Option<f64>,
    pub requests_per_min: f64,
    pub last_called: Option<i64>,
}

/// One row per route with traffic, busiest first.
pub fn overview_rows(totals: &[RouteTotals], range_secs: i64) -> Vec<OverviewRow> {
    let minutes = range_secs.max(60) as f64 / 60.0;
    let mut rows: Vec<OverviewRow> = totals
        .iter()
        .filter(|t| t.count > 0)
        .map(|t| OverviewRow {
            route: t.route.clone(),
            count: t.count,
            errors: t.errors(),
            error_rate: t.error_ratio().unwrap_or(0.0) * 100.0,
            avg_latency: t.weighted_avg(),
            median_latency: t.median_proxy(),
            min_latency: Some(t.min),
            max_latency: Some(t.max),
            requests_per_min: t.count as f64 / minutes,
            last_called: t.last_window,
        })
        .collect();
    rows.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.route.cmp(&b.route)));
    rows
}

// ─── Status histogram ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CountPoint {
    pub timestamp: i64,
    pub count: u64,
}

/// Per-step status class counts across all routes, for stacked bars.
/// Every class that occurs at all gets a point at every step.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusHistogram {
    pub classes: BTreeMap<StatusClass, Vec<CountPoint>>,
    /// 4XX + 5XX per step
    pub errors: Vec<CountPoint>,
}

pub fn status_histogram<'a>(
    buckets: impl IntoIterator<Item = &'a Bucket>,
    step: i64,
) -> StatusHistogram {
    let mut per_step: BTreeMap<i64, StatusCounts> = BTreeMap::new();
    for bucket in buckets {
        if bucket.status_code_counts.iter().next().is_none() {
            continue;
        }
        per_step
            .entry(Bucket::window_start_for(bucket.window_start, step))
            .or_default()
            .merge(&bucket.status_code_counts);
    }

    let present: BTreeSet<StatusClass> = per_step
        .values()
        .flat_map(|counts| counts.iter().map(|(class, _)| class))
        .collect();

    let mut histogram = StatusHistogram::default();
    for class in present {
        let points = per_step
            .iter()
            .map(|(ts, counts)| CountPoint {
                timestamp: *ts,
                count: counts.get(class),
            })
            .collect();
        histogram.classes.insert(class, points);
    }
    histogram.errors = per_step
        .iter()
        .map(|(ts, counts)| CountPoint {
            timestamp: *ts,
            count: counts.errors(),
        })
        .collect();
    histogram
}

// ─── Report ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct SystemReport {
    pub series: BTreeMap<&'static str, Vec<SeriesPoint>>,
    /// Average of the last point of each series, not an instantaneous reading
    pub current: BTreeMap<&'static str, f64>,
    pub num_threads: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReadWrite {
    pub bytes_in: Vec<SeriesPoint>,
    pub bytes_out: Vec<SeriesPoint>,
}

/// Everything the dashboard draws for one range.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardReport {
    pub ts_from: i64,
    pub ts_to: i64,
    pub bucket_size_secs: i64,
    pub system: SystemReport,
    pub read_write: BTreeMap<String, ReadWrite>,
    pub latencies: BTreeMap<String, Vec<SeriesPoint>>,
    pub status_code: StatusHistogram,
    pub requests_per_method: BTreeMap<String, u64>,
    pub overview_table: Vec<OverviewRow>,
    pub top_routes: Vec<RankedRoute>,
    pub top_slowest_routes: Vec<RankedRoute>,
    pub top_error_prone_requests: Vec<RankedRoute>,
}

// ─── Engine ──────────────────────────────────────────────────────

/// Answers dashboard queries from the backend plus the live open buckets.
pub struct QueryEngine {
    backend: Arc<Backend>,
    gateway: Arc<IngestionGateway>,
    rank_limit: usize,
    rank_min_samples: u64,
}

impl QueryEngine {
    pub fn new(
        backend: Arc<Backend>,
        gateway: Arc<IngestionGateway>,
        rank_limit: usize,
        rank_min_samples: u64,
    ) -> Self {
        Self {
            backend,
            gateway,
            rank_limit,
            rank_min_samples,
        }
    }

    /// Buckets of `key` with `window_start` in `[ts_from, ts_to]`, ascending.
    ///
    /// Reads follow the direction buckets travel in reverse: the store, then
    /// the flush queue, then the open bucket. A bucket that moves on between
    /// two reads leaves a momentary gap and is never counted twice.
    pub async fn buckets(
        &self,
        key: &SeriesKey,
        ts_from: i64,
        ts_to: i64,
    ) -> Result<Vec<Bucket>> {
        let stored = self.backend.query(key, ts_from, ts_to).await?;
        let unpersisted = self.gateway.unpersisted(key, ts_from, ts_to);

        let mut merged: BTreeMap<i64, Bucket> = BTreeMap::new();
        for bucket in stored.into_iter().chain(unpersisted) {
            match merged.get_mut(&bucket.window_start) {
                Some(existing) => existing.merge(&bucket),
                None => {
                    merged.insert(bucket.window_start, bucket);
                }
            }
        }
        Ok(merged.into_values().collect())
    }

    pub async fn series(
        &self,
        key: &SeriesKey,
        ts_from: i64,
        ts_to: i64,
    ) -> Result<Vec<SeriesPoint>> {
        Ok(project(&self.buckets(key, ts_from, ts_to).await?))
    }

    /// Persisted and live series whose key starts with `prefix`.
    pub async fn series_keys(&self, prefix: &str) -> Result<Vec<SeriesKey>> {
        let mut keys: BTreeSet<SeriesKey> =
            self.backend.list_series_keys(prefix).await?.into_iter().collect();
        keys.extend(self.gateway.series_keys(prefix));
        Ok(keys.into_iter().collect())
    }

    async fn latency_buckets(
        &self,
        ts_from: i64,
        ts_to: i64,
    ) -> Result<Vec<(String, Vec<Bucket>)>> {
        let keys = self
            .series_keys(&SeriesKey::request_prefix(RequestMetric::Latency))
            .await?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(route) = key.route().map(str::to_string) else { continue };
            let buckets = self.buckets(&key, ts_from, ts_to).await?;
            out.push((route, buckets));
        }
        Ok(out)
    }

    pub async fn route_totals(&self, ts_from: i64, ts_to: i64) -> Result<Vec<RouteTotals>> {
        Ok(self
            .latency_buckets(ts_from, ts_to)
            .await?
            .iter()
            .map(|(route, buckets)| RouteTotals::from_buckets(route, buckets))
            .collect())
    }

    pub async fn top_routes(&self, ts_from: i64, ts_to: i64) -> Result<Vec<RankedRoute>> {
        Ok(top_by_volume(&self.route_totals(ts_from, ts_to).await?, self.rank_limit))
    }

    pub async fn top_slowest_routes(&self, ts_from: i64, ts_to: i64) -> Result<Vec<RankedRoute>> {
        let totals = self.route_totals(ts_from, ts_to).await?;
        Ok(top_slowest(&totals, self.rank_limit, self.rank_min_samples))
    }

    pub async fn top_error_prone_routes(
        &self,
        ts_from: i64,
        ts_to: i64,
    ) -> Result<Vec<RankedRoute>> {
        let totals = self.route_totals(ts_from, ts_to).await?;
        Ok(top_error_prone(&totals, self.rank_limit, self.rank_min_samples))
    }

    pub async fn overview(&self, ts_from: i64, ts_to: i64) -> Result<Vec<OverviewRow>> {
        let totals = self.route_totals(ts_from, ts_to).await?;
        Ok(overview_rows(&totals, ts_to - ts_from))
    }

    pub async fn status_histogram(&self, ts_from: i64, ts_to: i64) -> Result<StatusHistogram> {
        let routes = self.latency_buckets(ts_from, ts_to).await?;
        Ok(status_histogram(
            routes.iter().flat_map(|(_, buckets)| buckets),
            self.histogram_step(),
        ))
    }

    pub async fn requests_per_method(
        &self,
        ts_from: i64,
        ts_to: i64,
    ) -> Result<BTreeMap<String, u64>> {
        let mut out = BTreeMap::new();
        for key in self.series_keys(SeriesKey::METHOD_PREFIX).await? {
            let SeriesKey::Method(method) = &key else { continue };
            let count = self
                .buckets(&key, ts_from, ts_to)
                .await?
                .iter()
                .map(|b| b.count)
                .sum::<u64>();
            if count > 0 {
                out.insert(method.clone(), count);
            }
        }
        Ok(out)
    }

    fn histogram_step(&self) -> i64 {
        STATUS_HISTOGRAM_STEP.max(self.gateway.window_size())
    }

    /// Full dashboard document for `[ts_from, ts_to]`. Any backend failure
    /// fails the whole report rather than returning partial data.
    pub async fn report(&self, ts_from: i64, ts_to: i64) -> Result<DashboardReport> {
        let resolution = display_resolution(ts_to - ts_from, self.gateway.window_size());
        let display = |buckets: &[Bucket]| project(&rebucket(buckets, resolution));

        let mut system = SystemReport {
            series: BTreeMap::new(),
            current: BTreeMap::new(),
            num_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        };
        for metric in SystemMetric::ALL {
            let points = display(&self.buckets(&SeriesKey::System(metric), ts_from, ts_to).await?);
            if let Some(last) = points.last() {
                system.current.insert(metric.name(), last.avg);
            }
            system.series.insert(metric.name(), points);
        }

        let routes = self.latency_buckets(ts_from, ts_to).await?;
        let totals: Vec<RouteTotals> = routes
            .iter()
            .map(|(route, buckets)| RouteTotals::from_buckets(route, buckets))
            .collect();
        let latencies = routes
            .iter()
            .map(|(route, buckets)| (route.clone(), display(buckets)))
            .filter(|(_, points)| !points.is_empty())
            .collect();
        let status_code = status_histogram(
            routes.iter().flat_map(|(_, buckets)| buckets),
            self.histogram_step(),
        );

        let mut read_write: BTreeMap<String, ReadWrite> = BTreeMap::new();
        for metric in [RequestMetric::BytesIn, RequestMetric::BytesOut] {
            for key in self.series_keys(&SeriesKey::request_prefix(metric)).await? {
                let Some(route) = key.route() else { continue };
                let points = display(&self.buckets(&key, ts_from, ts_to).await?);
                if points.is_empty() {
                    continue;
                }
                let entry = read_write.entry(route.to_string()).or_default();
                match metric {
                    RequestMetric::BytesIn => entry.bytes_in = points,
                    _ => entry.bytes_out = points,
                }
            }
        }

        Ok(DashboardReport {
            ts_from,
            ts_to,
            bucket_size_secs: resolution,
            system,
            read_write,
            latencies,
            status_code,
            requests_per_method: self.requests_per_method(ts_from, ts_to).await?,
            overview_table: overview_rows(&totals, ts_to - ts_from),
            top_routes: top_by_volume(&totals, self.rank_limit),
            top_slowest_routes: top_slowest(&totals, self.rank_limit, self.rank_min_samples),
            top_error_prone_requests: top_error_prone(
                &totals,
                self.rank_limit,
                self.rank_min_samples,
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn latency(route: &str, ws: i64, count: u64, avg: f64, errors: u64) -> Bucket {
        let mut bucket = Bucket::empty(SeriesKey::request(route, RequestMetric::Latency), ws, 60);
        for i in 0..count {
            let class = if i < errors {
                StatusClass::ServerError
            } else {
                StatusClass::Success
            };
            bucket.fold(avg, Some(class));
        }
        bucket
    }

    fn totals(route: &str, count: u64, avg: f64, errors: u64) -> RouteTotals {
        RouteTotals::from_buckets(route, &[latency(route, 0, count, avg, errors)])
    }

    #[test]
    fn slowest_uses_weighted_average_and_threshold() {
        let routes = [totals("/a", 100, 0.01, 0), totals("/b", 2, 5.0, 0)];

        let ranked = top_slowest(&routes, 5, 2);
        assert_eq!(ranked[0].route, "/b");
        assert_eq!(ranked[1].route, "/a");

        let ranked = top_slowest(&routes, 5, 5);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].route, "/a");
    }

    #[test]
    fn weighted_average_is_not_average_of_averages() {
        let t = RouteTotals::from_buckets(
            "/a",
            &[latency("/a", 0, 9, 1.0, 0), latency("/a", 60, 1, 11.0, 0)],
        );
        assert_eq!(t.weighted_avg(), Some(2.0));
        assert_eq!(t.median_proxy(), Some(6.0));
    }

    #[test]
    fn volume_ties_break_on_route_name() {
        let routes = [totals("/b", 3, 1.0, 0), totals("/a", 3, 1.0, 0), totals("/c", 7, 1.0, 0)];
        let order: Vec<String> = top_by_volume(&routes, 2).into_iter().map(|r| r.route).collect();
        assert_eq!(order, vec!["/c", "/a"]);
    }

    #[test]
    fn error_prone_ranks_by_ratio_above_threshold() {
        let routes = [
            totals("/flaky", 10, 0.1, 5),
            totals("/broken", 2, 0.1, 2),
            totals("/fine", 50, 0.1, 0),
            totals("/meh", 20, 0.1, 2),
        ];
        let ranked = top_error_prone(&routes, 5, 5);
        let order: Vec<&str> = ranked.iter().map(|r| r.route.as_str()).collect();
        assert_eq!(order, vec!["/flaky", "/meh"]);
        assert_eq!(ranked[0].value, 0.5);
    }

    #[test]
    fn overview_rows_carry_rates() {
        let rows = overview_rows(&[totals("/a", 120, 0.5, 30)], 600);
        let row = &rows[0];
        assert_eq!(row.errors, 30);
        assert_eq!(row.error_rate, 25.0);
        assert_eq!(row.requests_per_min, 12.0);
        assert_eq!(row.last_called, Some(0));
    }

    #[test]
    fn empty_buckets_never_become_points() {
        let key = SeriesKey::request("/a", RequestMetric::Latency);
        let points = project(&[
            Bucket::empty(key.clone(), 0, 60),
            Bucket::single(key, 60, 60, 2.0, None),
        ]);
        assert_eq!(points, vec![SeriesPoint { timestamp: 60, min: 2.0, avg: 2.0, max: 2.0 }]);
    }

    #[test]
    fn display_resolution_follows_range_and_window() {
        assert_eq!(display_resolution(HOUR, 10), 10);
        assert_eq!(display_resolution(HOUR, 60), 60);
        assert_eq!(display_resolution(DAY, 10), 300);
        assert_eq!(display_resolution(DAY, 120), 360);
        assert_eq!(display_resolution(WEEK, 10), HOUR);
        assert_eq!(display_resolution(30 * DAY, 10), 30 * DAY / 200);
    }

    #[test]
    fn rebucket_merges_into_coarser_windows() {
        let buckets = [
            latency("/a", 0, 1, 1.0, 0),
            latency("/a", 60, 3, 3.0, 0),
            latency("/a", 300, 1, 9.0, 0),
        ];
        let coarse = rebucket(&buckets, 300);
        assert_eq!(coarse.len(), 2);
        assert_eq!((coarse[0].window_start, coarse[0].count), (0, 4));
        assert_eq!(coarse[0].avg(), Some(2.5));
        assert_eq!(coarse[0].window_size, 300);
    }

    #[test]
    fn histogram_extracts_error_series() {
        let buckets = [
            latency("/a", 0, 4, 0.1, 1),
            latency("/b", 0, 2, 0.1, 2),
            latency("/a", 60, 1, 0.1, 0),
        ];
        let histogram = status_histogram(&buckets, 60);

        let success = &histogram.classes[&StatusClass::Success];
        assert_eq!(
            success,
            &vec![
                CountPoint { timestamp: 0, count: 3 },
                CountPoint { timestamp: 60, count: 1 },
            ]
        );
        assert_eq!(histogram.errors[0].count, 3);
        assert_eq!(histogram.errors[1].count, 0);
        assert!(!histogram.classes.contains_key(&StatusClass::ClientError));

        let json = serde_json::to_value(&histogram).unwrap();
        assert_eq!(json["classes"]["5XX"][0]["count"], 3);
    }
}
