use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection};
use tracing::{info_span, warn};

use crate::error::{MetricsError, Result};
use crate::metrics::{Bucket, Diagnostics, SeriesKey, StatusClass, StatusCounts};

/// DDL for the bucket table. One row per `(series_key, window_start)`;
/// status classes get a column each so merges stay in SQL.
const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS buckets (
    series_key   TEXT    NOT NULL,
    window_start INTEGER NOT NULL,
    window_size  INTEGER NOT NULL,
    count        INTEGER NOT NULL,
    sum          REAL    NOT NULL,
    min          REAL    NOT NULL,
    max          REAL    NOT NULL,
    c1xx         INTEGER NOT NULL DEFAULT 0,
    c2xx         INTEGER NOT NULL DEFAULT 0,
    c3xx         INTEGER NOT NULL DEFAULT 0,
    c4xx         INTEGER NOT NULL DEFAULT 0,
    c5xx         INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (series_key, window_start)
) WITHOUT ROWID;
";

/// Numeric merge on conflict. SQLite evaluates every SET expression against
/// the pre-update row, so the order of assignments does not matter.
const UPSERT: &str = r"
INSERT INTO buckets
    (series_key, window_start, window_size, count, sum, min, max,
     c1xx, c2xx, c3xx, c4xx, c5xx)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
ON CONFLICT(series_key, window_start) DO UPDATE SET
    count = buckets.count + excluded.count,
    sum   = buckets.sum + excluded.sum,
    min   = MIN(buckets.min, excluded.min),
    max   = MAX(buckets.max, excluded.max),
    c1xx  = buckets.c1xx + excluded.c1xx,
    c2xx  = buckets.c2xx + excluded.c2xx,
    c3xx  = buckets.c3xx + excluded.c3xx,
    c4xx  = buckets.c4xx + excluded.c4xx,
    c5xx  = buckets.c5xx + excluded.c5xx
";

const SELECT_RANGE: &str = r"
SELECT window_start, window_size, count, sum, min, max, c1xx, c2xx, c3xx, c4xx, c5xx
FROM buckets
WHERE series_key = ?1 AND window_start >= ?2 AND window_start <= ?3
ORDER BY window_start
";

const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(2);

/// Single-table SQLite store. Flushes arrive in batches and each batch is
/// one transaction, so the disk sees one write per batch rather than per
/// sample.
#[derive(Clone)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
    lock_wait: Duration,
    diagnostics: Arc<Diagnostics>,
}

impl SqliteBackend {
    /// Open or create the store at `path`. WAL keeps readers off the writer.
    pub fn open(path: &Path, diagnostics: Arc<Diagnostics>) -> Result<Self> {
        let _span = info_span!("sqlite_open", path = %path.display()).entered();
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::with_connection(conn, diagnostics)
    }

    /// Throwaway store for tests.
    pub fn open_in_memory(diagnostics: Arc<Diagnostics>) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, diagnostics)
    }

    fn with_connection(conn: Connection, diagnostics: Arc<Diagnostics>) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Self {
            conn: Arc::new(Mutex::new(conn)),
            lock_wait: DEFAULT_LOCK_WAIT,
            diagnostics,
        }
        .with_lock_wait(DEFAULT_LOCK_WAIT)
    }

    /// How long a call waits for the connection, and for SQLite's file lock,
    /// before giving up without having written anything.
    pub fn with_lock_wait(mut self, wait: Duration) -> Result<Self> {
        self.conn.lock().busy_timeout(wait)?;
        self.lock_wait = wait;
        Ok(self)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.try_lock_for(self.lock_wait).ok_or_else(|| {
            MetricsError::BackendUnavailable(format!(
                "sqlite connection busy for more than {}ms",
                self.lock_wait.as_millis()
            ))
        })
    }

    #[cfg(test)]
    pub(crate) fn lock_connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    pub fn upsert_batch(&self, buckets: &[Bucket]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(UPSERT)?;
            for b in buckets.iter().filter(|b| !b.is_empty()) {
                let c = &b.status_code_counts;
                stmt.execute(params![
                    b.series_key.to_string(),
                    b.window_start,
                    b.window_size,
                    b.count as i64,
                    b.sum,
                    b.min,
                    b.max,
                    c.get(StatusClass::Informational) as i64,
                    c.get(StatusClass::Success) as i64,
                    c.get(StatusClass::Redirection) as i64,
                    c.get(StatusClass::ClientError) as i64,
                    c.get(StatusClass::ServerError) as i64,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn query(&self, key: &SeriesKey, ts_from: i64, ts_to: i64) -> Result<Vec<Bucket>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(SELECT_RANGE)?;
        let rows = stmt.query_map(params![key.to_string(), ts_from, ts_to], |row| {
            Ok(RawRow {
                window_start: row.get(0)?,
                window_size: row.get(1)?,
                count: row.get(2)?,
                sum: row.get(3)?,
                min: row.get(4)?,
                max: row.get(5)?,
                classes: [row.get(6)?, row.get(7)?, row.get(8)?, row.get(9)?, row.get(10)?],
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            let decoded = row
                .map_err(|e| e.to_string())
                .and_then(|raw| raw.into_bucket(key.clone()));
            match decoded {
                Ok(bucket) => out.push(bucket),
                Err(reason) => {
                    let err = MetricsError::BackendCorrupt {
                        series_key: key.to_string(),
                        reason,
                    };
                    warn!(error = %err, "skipping bucket");
                    self.diagnostics.corrupt_bucket();
                }
            }
        }
        Ok(out)
    }

    pub fn delete_before(&self, prefix: &str, cutoff: i64) -> Result<u64> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM buckets \
             WHERE substr(series_key, 1, length(?1)) = ?1 AND window_start < ?2",
            params![prefix, cutoff],
        )?;
        Ok(removed as u64)
    }

    pub fn list_series_keys(&self, prefix: &str) -> Result<Vec<SeriesKey>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT series_key FROM buckets \
             WHERE substr(series_key, 1, length(?1)) = ?1 \
             ORDER BY series_key",
        )?;
        let raw: Vec<String> = stmt
            .query_map(params![prefix], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;

        let mut keys = Vec::with_capacity(raw.len());
        for text in raw {
            match text.parse::<SeriesKey>() {
                Ok(key) => keys.push(key),
                Err(err) => {
                    warn!(error = %err, "skipping series");
                    self.diagnostics.corrupt_bucket();
                }
            }
        }
        Ok(keys)
    }

    pub fn reset(&self) -> Result<()> {
        self.conn()?.execute("DELETE FROM buckets", [])?;
        Ok(())
    }

    pub fn check_health(&self) -> Result<()> {
        self.conn()?
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    /// Fold the WAL back into the main file before shutdown.
    pub fn checkpoint(&self) -> Result<()> {
        self.conn()?
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }
}

struct RawRow {
    window_start: i64,
    window_size: i64,
    count: i64,
    sum: f64,
    min: f64,
    max: f64,
    classes: [i64; 5],
}

impl RawRow {
    fn into_bucket(self, series_key: SeriesKey) -> std::result::Result<Bucket, String> {
        if self.count < 0 || self.classes.iter().any(|n| *n < 0) {
            return Err(format!("negative counter at window {}", self.window_start));
        }
        let mut status_code_counts = StatusCounts::default();
        for (class, n) in StatusClass::ALL.into_iter().zip(self.classes) {
            status_code_counts.add(class, n as u64);
        }
        let bucket = Bucket {
            series_key,
            window_start: self.window_start,
            window_size: self.window_size,
            count: self.count as u64,
            sum: self.sum,
            min: self.min,
            max: self.max,
            status_code_counts,
        };
        if !bucket.is_consistent() {
            return Err(format!("inconsistent statistics at window {}", self.window_start));
        }
        Ok(bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::RequestMetric;

    fn store() -> SqliteBackend {
        SqliteBackend::open_in_memory(Arc::new(Diagnostics::new())).unwrap()
    }

    fn key() -> SeriesKey {
        SeriesKey::request("/orders", RequestMetric::Latency)
    }

    #[test]
    fn conflicting_upserts_merge() {
        let store = store();
        let a = Bucket::single(key(), 60, 60, 0.1, StatusClass::from_code(200));
        let b = Bucket::single(key(), 60, 60, 0.3, StatusClass::from_code(503));
        store.upsert_batch(&[a]).unwrap();
        store.upsert_batch(&[b]).unwrap();

        let got = store.query(&key(), 0, 120).unwrap();
        assert_eq!(got.len(), 1);
        let bucket = &got[0];
        assert_eq!(bucket.count, 2);
        assert!((bucket.sum - 0.4).abs() < 1e-12);
        assert_eq!((bucket.min, bucket.max), (0.1, 0.3));
        assert_eq!(bucket.status_code_counts.get(StatusClass::Success), 1);
        assert_eq!(bucket.status_code_counts.get(StatusClass::ServerError), 1);
    }

    #[test]
    fn corrupt_rows_are_skipped_and_counted() {
        let diagnostics = Arc::new(Diagnostics::new());
        let store = SqliteBackend::open_in_memory(diagnostics.clone()).unwrap();
        store
            .upsert_batch(&[Bucket::single(key(), 0, 60, 1.0, None)])
            .unwrap();
        store
            .conn
            .lock()
            .execute(
                "INSERT INTO buckets (series_key, window_start, window_size, count, sum, min, max) \
                 VALUES (?1, 60, 60, 2, 10.0, 9.0, 1.0)",
                params![key().to_string()],
            )
            .unwrap();

        let got = store.query(&key(), 0, 600).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(diagnostics.snapshot().backend_corrupt, 1);
    }

    #[test]
    fn series_listing_and_prefix_delete() {
        let store = store();
        let other = SeriesKey::Method("GET".into());
        store
            .upsert_batch(&[
                Bucket::single(key(), 0, 60, 1.0, None),
                Bucket::single(key(), 60, 60, 1.0, None),
                Bucket::single(other.clone(), 0, 60, 1.0, None),
            ])
            .unwrap();

        assert_eq!(store.list_series_keys("").unwrap(), vec![other.clone(), key()]);
        assert_eq!(store.list_series_keys("request:").unwrap(), vec![key()]);

        assert_eq!(store.delete_before("request:", 60).unwrap(), 1);
        assert_eq!(store.query(&key(), 0, 600).unwrap().len(), 1);
        assert_eq!(store.query(&other, 0, 600).unwrap().len(), 1);

        store.reset().unwrap();
        assert!(store.list_series_keys("").unwrap().is_empty());
        store.check_health().unwrap();
    }
}
