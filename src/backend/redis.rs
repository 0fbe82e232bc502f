use std::sync::Arc;

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Script};
use tracing::warn;

use super::BatchId;
use crate::error::{MetricsError, Result};
use crate::metrics::{Bucket, Diagnostics, SeriesKey};

/// Merge `ARGV[2]` into whatever member of `KEYS[1]` sits at score `ARGV[1]`
/// and register the series in `KEYS[2]`, atomically on the server.
///
/// `KEYS[3]` records which positions of the current flush batch were
/// applied. A retried batch skips them, so a call that timed out after
/// reaching the server is not merged again.
const MERGE_SCRIPT: &str = r"
if redis.call('SADD', KEYS[3], ARGV[4]) == 0 then
  return 0
end
redis.call('EXPIRE', KEYS[3], tonumber(ARGV[5]))
local score = tonumber(ARGV[1])
local incoming = cjson.decode(ARGV[2])
local existing = redis.call('ZRANGEBYSCORE', KEYS[1], score, score)
for _, raw in ipairs(existing) do
  local ok, cur = pcall(cjson.decode, raw)
  if ok and type(cur) == 'table' and tonumber(cur.count) then
    incoming.count = incoming.count + cur.count
    incoming.sum = incoming.sum + cur.sum
    if cur.min < incoming.min then incoming.min = cur.min end
    if cur.max > incoming.max then incoming.max = cur.max end
    if type(cur.status_code_counts) == 'table' then
      for class, n in pairs(cur.status_code_counts) do
        incoming.status_code_counts[class] = (incoming.status_code_counts[class] or 0) + n
      end
    end
  end
  redis.call('ZREM', KEYS[1], raw)
end
redis.call('ZADD', KEYS[1], score, cjson.encode(incoming))
redis.call('SADD', KEYS[2], ARGV[3])
return 1
";

/// Seconds a batch's applied-set outlives its last write. Far longer than
/// any retry schedule.
const BATCH_MARK_TTL_SECS: u64 = 3_600;

/// One sorted set per series, scored by `window_start`, each member the
/// JSON-encoded bucket. A set indexes the known series.
///
/// `ConnectionManager` clones share one multiplexed connection and
/// reconnect after transient failures.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    namespace: String,
    merge: Arc<Script>,
    diagnostics: Arc<Diagnostics>,
}

impl RedisBackend {
    pub async fn connect(
        url: &str,
        namespace: &str,
        diagnostics: Arc<Diagnostics>,
    ) -> Result<Self> {
        let client = ::redis::Client::open(url).map_err(|e| {
            MetricsError::BackendUnavailable(format!("invalid redis url {url:?}: {e}"))
        })?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            namespace: namespace.to_string(),
            merge: Arc::new(Script::new(MERGE_SCRIPT)),
            diagnostics,
        })
    }

    fn series_key(&self, key: &str) -> String {
        format!("{}:series:{key}", self.namespace)
    }

    fn index_key(&self) -> String {
        format!("{}:series-index", self.namespace)
    }

    fn batch_key(&self, batch: BatchId) -> String {
        format!("{}:flush:{batch}", self.namespace)
    }

    /// Merge `buckets` one script call at a time. Retrying with the same
    /// `batch` skips the buckets the server already applied.
    pub async fn upsert_batch(&self, buckets: &[Bucket], batch: BatchId) -> Result<()> {
        let mut conn = self.conn.clone();
        let index = self.index_key();
        let applied = self.batch_key(batch);
        for (position, bucket) in buckets.iter().enumerate() {
            if bucket.is_empty() {
                continue;
            }
            let name = bucket.series_key.to_string();
            let member = encode_member(bucket)?;
            let _: i64 = self
                .merge
                .key(self.series_key(&name))
                .key(&index)
                .key(&applied)
                .arg(bucket.window_start)
                .arg(member)
                .arg(&name)
                .arg(position)
                .arg(BATCH_MARK_TTL_SECS)
                .invoke_async(&mut conn)
                .await?;
        }
        Ok(())
    }

    pub async fn query(&self, key: &SeriesKey, ts_from: i64, ts_to: i64) -> Result<Vec<Bucket>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn
            .zrangebyscore(self.series_key(&key.to_string()), ts_from, ts_to)
            .await?;

        let mut out = Vec::with_capacity(members.len());
        for raw in members {
            match decode_member(key, &raw) {
                Ok(bucket) => out.push(bucket),
                Err(err) => {
                    warn!(error = %err, "skipping bucket");
                    self.diagnostics.corrupt_bucket();
                }
            }
        }
        out.sort_by_key(|b| b.window_start);
        Ok(out)
    }

    pub async fn delete_before(&self, prefix: &str, cutoff: i64) -> Result<u64> {
        let mut conn = self.conn.clone();
        let index = self.index_key();
        let names: Vec<String> = conn.smembers(&index).await?;

        let mut removed = 0u64;
        for name in names.iter().filter(|n| n.starts_with(prefix)) {
            let zkey = self.series_key(name);
            let n: u64 = conn
                .zrembyscore(&zkey, "-inf", format!("({cutoff}"))
                .await?;
            removed += n;
            let left: u64 = conn.zcard(&zkey).await?;
            if left == 0 {
                let _: u64 = conn.srem(&index, name).await?;
            }
        }
        Ok(removed)
    }

    pub async fn list_series_keys(&self, prefix: &str) -> Result<Vec<SeriesKey>> {
        let mut conn = self.conn.clone();
        let names: Vec<String> = conn.smembers(self.index_key()).await?;

        let mut keys = Vec::with_capacity(names.len());
        for name in names.into_iter().filter(|n| n.starts_with(prefix)) {
            match name.parse::<SeriesKey>() {
                Ok(key) => keys.push(key),
                Err(err) => {
                    warn!(error = %err, "skipping series");
                    self.diagnostics.corrupt_bucket();
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    pub async fn reset(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let index = self.index_key();
        let names: Vec<String> = conn.smembers(&index).await?;
        for name in &names {
            let _: u64 = conn.del(self.series_key(name)).await?;
        }
        let _: u64 = conn.del(&index).await?;
        Ok(())
    }

    pub async fn check_health(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

fn encode_member(bucket: &Bucket) -> Result<String> {
    serde_json::to_string(bucket).map_err(|e| MetricsError::BackendCorrupt {
        series_key: bucket.series_key.to_string(),
        reason: format!("cannot encode bucket: {e}"),
    })
}

fn decode_member(key: &SeriesKey, raw: &str) -> Result<Bucket> {
    let corrupt = |reason: String| MetricsError::BackendCorrupt {
        series_key: key.to_string(),
        reason,
    };
    let bucket: Bucket = serde_json::from_str(raw).map_err(|e| corrupt(e.to_string()))?;
    if &bucket.series_key != key {
        return Err(corrupt(format!("member belongs to '{}'", bucket.series_key)));
    }
    if !bucket.is_consistent() {
        return Err(corrupt(format!(
            "inconsistent statistics at window {}",
            bucket.window_start
        )));
    }
    Ok(bucket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{RequestMetric, StatusClass};

    fn key() -> SeriesKey {
        SeriesKey::request("/orders", RequestMetric::Latency)
    }

    #[test]
    fn members_decode_back_to_buckets() {
        let bucket = Bucket::single(key(), 120, 60, 0.5, Some(StatusClass::Success));
        let raw = encode_member(&bucket).unwrap();
        assert_eq!(decode_member(&key(), &raw).unwrap(), bucket);
    }

    #[test]
    fn lua_rounded_integers_still_decode() {
        // cjson writes whole floats without a fraction
        let raw = r#"{"series_key":"request:latency:/orders","window_start":60,"window_size":60,
                      "count":2,"sum":1,"min":0,"max":1,"status_code_counts":{"2XX":2}}"#;
        let bucket = decode_member(&key(), raw).unwrap();
        assert_eq!(bucket.count, 2);
        assert_eq!(bucket.status_code_counts.get(StatusClass::Success), 2);
    }

    #[test]
    fn foreign_or_garbled_members_are_corrupt() {
        let other = Bucket::single(SeriesKey::Method("GET".into()), 0, 60, 1.0, None);
        let raw = encode_member(&other).unwrap();
        assert!(matches!(
            decode_member(&key(), &raw),
            Err(MetricsError::BackendCorrupt { .. })
        ));
        assert!(decode_member(&key(), "{not json").is_err());
    }

    /// Needs a live server: `REDIS_URL=redis://127.0.0.1/ cargo test -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn merges_against_live_redis() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/".into());
        let store = RedisBackend::connect(&url, "metrics-test", Arc::new(Diagnostics::new()))
            .await
            .unwrap();
        store.reset().await.unwrap();

        let batch = [
            Bucket::single(key(), 0, 60, 0.1, StatusClass::from_code(200)),
            Bucket::single(key(), 0, 60, 0.3, StatusClass::from_code(500)),
            Bucket::single(key(), 60, 60, 1.0, None),
        ];
        let id = BatchId::new();
        store.upsert_batch(&batch, id).await.unwrap();
        // A retry of the same batch changes nothing
        store.upsert_batch(&batch, id).await.unwrap();

        let got = store.query(&key(), 0, 0).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].count, 2);
        assert_eq!((got[0].min, got[0].max), (0.1, 0.3));

        assert_eq!(store.list_series_keys("request:").await.unwrap(), vec![key()]);
        assert_eq!(store.delete_before("", 60).await.unwrap(), 1);
        assert_eq!(store.query(&key(), 0, 600).await.unwrap().len(), 1);

        store.reset().await.unwrap();
        assert!(store.list_series_keys("").await.unwrap().is_empty());
    }
}
