//! Redis implementation of the shared tier.
//!
//! ## Storage Layout
//!
//! Each cache key is a Redis hash:
//!
//! | Field  | Meaning                                             |
//! |--------|-----------------------------------------------------|
//! | `data` | payload bytes                                       |
//! | `sld`  | sliding window in milliseconds, `-1` if none        |
//! | `abs`  | absolute deadline in unix milliseconds, `-1` if none |
//!
//! The hash is written in a single `MULTI` block together with its `PEXPIRE`,
//! so readers never observe a payload without its expiry. Reads of sliding
//! entries push the expiry forward, but never past the absolute deadline.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use deadpool_redis::{Connection, Pool, PoolConfig, Runtime, Timeouts};
use tiercache_core::{CacheKey, RemoteTier, StoreError, Tier2Policy};

use crate::config::RedisConfig;

const DATA_FIELD: &str = "data";
const SLIDING_FIELD: &str = "sld";
const ABSOLUTE_FIELD: &str = "abs";
const NONE_MARKER: i64 = -1;
/// Longest expiry handed to Redis (100 years). Redis rejects a `PEXPIRE`
/// whose deadline overflows, and inside `MULTI` that leaves the hash without
/// any expiry.
const MAX_TTL_MS: i64 = 100 * 365 * 24 * 60 * 60 * 1000;

/// Tier-2 store backed by a Redis connection pool.
#[derive(Clone)]
pub struct RedisTier {
    pool: Pool,
}

impl RedisTier {
    /// Wrap an existing pool.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<Connection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::connection(e.to_string()))
    }

    async fn refresh_sliding(
        &self,
        conn: &mut Connection,
        key: &CacheKey,
        sliding_ms: i64,
        absolute_ms: i64,
    ) {
        let Some(ttl_ms) = sliding_refresh_ttl(sliding_ms, absolute_ms, unix_millis()) else {
            return;
        };
        let result: redis::RedisResult<i64> = redis::cmd("PEXPIRE")
            .arg(key.as_str())
            .arg(ttl_ms)
            .query_async(conn)
            .await;
        if let Err(e) = result {
            tracing::warn!(key = %key, error = %e, "Redis PEXPIRE error on sliding refresh");
        }
    }
}

#[async_trait]
impl RemoteTier for RedisTier {
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn().await?;
        let (data, sliding, absolute): (Option<Vec<u8>>, Option<i64>, Option<i64>) =
            redis::cmd("HMGET")
                .arg(key.as_str())
                .arg(DATA_FIELD)
                .arg(SLIDING_FIELD)
                .arg(ABSOLUTE_FIELD)
                .query_async(&mut conn)
                .await
                .map_err(backend_error)?;

        let Some(data) = data else {
            tracing::debug!(key = %key, "redis miss");
            return Ok(None);
        };

        if let Some(sliding_ms) = sliding.filter(|ms| *ms > 0) {
            let absolute_ms = absolute.unwrap_or(NONE_MARKER);
            self.refresh_sliding(&mut conn, key, sliding_ms, absolute_ms)
                .await;
        }

        tracing::debug!(key = %key, bytes = data.len(), "redis hit");
        Ok(Some(data))
    }

    async fn set(
        &self,
        key: &CacheKey,
        payload: &[u8],
        policy: &Tier2Policy,
    ) -> Result<(), StoreError> {
        let expiration = policy.expiration;
        let sliding_ms = expiration
            .sliding_ttl()
            .map_or(NONE_MARKER, ttl_millis);
        let absolute_ms = expiration
            .absolute_ttl()
            .map_or(NONE_MARKER, |d| unix_millis().saturating_add(ttl_millis(d)));
        let ttl_ms = ttl_millis(expiration.initial_ttl()).max(1);

        let mut conn = self.conn().await?;
        let _: () = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(key.as_str())
            .ignore()
            .cmd("HSET")
            .arg(key.as_str())
            .arg(DATA_FIELD)
            .arg(payload)
            .arg(SLIDING_FIELD)
            .arg(sliding_ms)
            .arg(ABSOLUTE_FIELD)
            .arg(absolute_ms)
            .ignore()
            .cmd("PEXPIRE")
            .arg(key.as_str())
            .arg(ttl_ms)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(backend_error)?;

        tracing::debug!(key = %key, ttl_ms, bytes = payload.len(), "redis set");
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: i64 = redis::cmd("DEL")
            .arg(key.as_str())
            .query_async(&mut conn)
            .await
            .map_err(backend_error)?;
        tracing::debug!(key = %key, "redis delete");
        Ok(())
    }

    /// Check that a connection can be obtained and answers `PING`.
    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(backend_error)?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// Build a Redis tier from configuration.
///
/// The pool is created lazily: a successful return does not mean Redis is
/// reachable. Use [`RemoteTier::ping`] for that.
pub fn create_redis_tier(config: &RedisConfig) -> Result<RedisTier, StoreError> {
    let timeout = Duration::from_millis(config.timeout_ms);

    let mut timeouts = Timeouts::default();
    timeouts.wait = Some(timeout);
    timeouts.create = Some(timeout);
    timeouts.recycle = Some(timeout);

    let mut pool_config = PoolConfig::new(config.pool_size);
    pool_config.timeouts = timeouts;

    let mut redis_config = deadpool_redis::Config::from_url(&config.url);
    redis_config.pool = Some(pool_config);

    let pool = redis_config
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|e| StoreError::connection(format!("failed to create Redis pool: {e}")))?;

    tracing::info!(url = %config.url, pool_size = config.pool_size, "Redis tier created");
    Ok(RedisTier::new(pool))
}

fn backend_error(e: redis::RedisError) -> StoreError {
    StoreError::backend(e.to_string())
}

fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Milliseconds for a TTL, capped at [`MAX_TTL_MS`].
fn ttl_millis(d: Duration) -> i64 {
    duration_millis(d).min(MAX_TTL_MS)
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(duration_millis)
        .unwrap_or(0)
}

/// New TTL for a sliding entry read at `now_ms`, capped by the absolute
/// deadline. `None` when the entry is already past its deadline.
fn sliding_refresh_ttl(sliding_ms: i64, absolute_ms: i64, now_ms: i64) -> Option<i64> {
    let sliding_ms = sliding_ms.min(MAX_TTL_MS);
    if absolute_ms == NONE_MARKER {
        return Some(sliding_ms);
    }
    let remaining = absolute_ms.saturating_sub(now_ms);
    (remaining > 0).then(|| sliding_ms.min(remaining))
}
