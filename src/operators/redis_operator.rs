use crate::{
    data::models::{CrawlProgress, RedisPool},
    errors::ServiceError,
};
use actix_web::web;

// One backing store, three concerns with independent TTLs: a progress channel
// for polling clients, a per-site cooldown lock, and rate-limit counters.
const PROGRESS_KEY_PREFIX: &str = "crawl:progress:";
const COOLDOWN_KEY_PREFIX: &str = "crawl:cooldown:";
const SESSION_KEY_PREFIX: &str = "ratelimit:session:";
const IP_KEY_PREFIX: &str = "ratelimit:ip:";

pub const PROGRESS_TTL_SECONDS: u64 = 3600;
pub const SESSION_LIMIT_TTL_SECONDS: u64 = 24 * 60 * 60;
pub const IP_LIMIT_TTL_SECONDS: u64 = 60 * 60;
pub const DEFAULT_IP_LIMIT: i64 = 50;

async fn redis_conn(
    redis_pool: &web::Data<RedisPool>,
) -> Result<bb8_redis::bb8::PooledConnection<'_, bb8_redis::RedisConnectionManager>, ServiceError> {
    redis_pool
        .get()
        .await
        .map_err(|err| ServiceError::InternalServerError(format!("Redis unavailable: {}", err)))
}

#[tracing::instrument(skip(redis_pool, progress))]
pub async fn set_crawl_progress(
    site_id: uuid::Uuid,
    progress: &CrawlProgress,
    redis_pool: &web::Data<RedisPool>,
) -> Result<(), ServiceError> {
    let serialized = serde_json::to_string(progress).map_err(|err| {
        ServiceError::InternalServerError(format!("Failed to serialize crawl progress: {}", err))
    })?;

    let mut conn = redis_conn(redis_pool).await?;
    redis::cmd("SETEX")
        .arg(format!("{}{}", PROGRESS_KEY_PREFIX, site_id))
        .arg(PROGRESS_TTL_SECONDS)
        .arg(serialized)
        .query_async::<()>(&mut *conn)
        .await
        .map_err(|err| ServiceError::InternalServerError(err.to_string()))?;

    Ok(())
}

#[tracing::instrument(skip(redis_pool))]
pub async fn get_crawl_progress(
    site_id: uuid::Uuid,
    redis_pool: &web::Data<RedisPool>,
) -> Result<Option<CrawlProgress>, ServiceError> {
    let mut conn = redis_conn(redis_pool).await?;
    let serialized: Option<String> = redis::cmd("GET")
        .arg(format!("{}{}", PROGRESS_KEY_PREFIX, site_id))
        .query_async(&mut *conn)
        .await
        .map_err(|err| ServiceError::InternalServerError(err.to_string()))?;

    match serialized {
        Some(serialized) => serde_json::from_str(&serialized).map(Some).map_err(|err| {
            ServiceError::InternalServerError(format!("Corrupt crawl progress: {}", err))
        }),
        None => Ok(None),
    }
}

#[tracing::instrument(skip(redis_pool))]
pub async fn clear_crawl_progress(
    site_id: uuid::Uuid,
    redis_pool: &web::Data<RedisPool>,
) -> Result<(), ServiceError> {
    let mut conn = redis_conn(redis_pool).await?;
    redis::cmd("DEL")
        .arg(format!("{}{}", PROGRESS_KEY_PREFIX, site_id))
        .query_async::<()>(&mut *conn)
        .await
        .map_err(|err| ServiceError::InternalServerError(err.to_string()))?;
    Ok(())
}

/// The cooldown key doubles as the one-crawl-per-site lock: a crawl may only
/// be enqueued while the key is absent.
#[tracing::instrument(skip(redis_pool))]
pub async fn can_start_crawl(
    site_id: uuid::Uuid,
    redis_pool: &web::Data<RedisPool>,
) -> Result<bool, ServiceError> {
    let mut conn = redis_conn(redis_pool).await?;
    let exists: i64 = redis::cmd("EXISTS")
        .arg(format!("{}{}", COOLDOWN_KEY_PREFIX, site_id))
        .query_async(&mut *conn)
        .await
        .map_err(|err| ServiceError::InternalServerError(err.to_string()))?;
    Ok(exists == 0)
}

#[tracing::instrument(skip(redis_pool))]
pub async fn record_crawl_start(
    site_id: uuid::Uuid,
    redis_pool: &web::Data<RedisPool>,
) -> Result<(), ServiceError> {
    let cooldown_hours: u64 = std::env::var("RECRAWL_COOLDOWN_HOURS")
        .unwrap_or("1".to_string())
        .parse()
        .unwrap_or(1);

    let mut conn = redis_conn(redis_pool).await?;
    redis::cmd("SETEX")
        .arg(format!("{}{}", COOLDOWN_KEY_PREFIX, site_id))
        .arg(cooldown_hours * 3600)
        .arg(chrono::Utc::now().timestamp())
        .query_async::<()>(&mut *conn)
        .await
        .map_err(|err| ServiceError::InternalServerError(err.to_string()))?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub allowed: bool,
    pub remaining: i64,
    pub retry_after_secs: u64,
}

/// Pure limit decision, shared by both counters. `ttl_secs` is the TTL of the
/// live counter key (negative when the key is missing or has no expiry).
pub fn evaluate_limit(count: i64, limit: i64, ttl_secs: i64, window_secs: u64) -> RateLimitStatus {
    if count >= limit {
        RateLimitStatus {
            allowed: false,
            remaining: 0,
            retry_after_secs: ttl_secs.max(0) as u64,
        }
    } else {
        RateLimitStatus {
            allowed: true,
            remaining: limit - count,
            retry_after_secs: window_secs,
        }
    }
}

async fn check_counter(
    key: String,
    limit: i64,
    window_secs: u64,
    redis_pool: &web::Data<RedisPool>,
) -> Result<RateLimitStatus, ServiceError> {
    let mut conn = redis_conn(redis_pool).await?;
    let count: Option<i64> = redis::cmd("GET")
        .arg(&key)
        .query_async(&mut *conn)
        .await
        .map_err(|err| ServiceError::InternalServerError(err.to_string()))?;
    let count = count.unwrap_or(0);

    let ttl_secs: i64 = if count >= limit {
        redis::cmd("TTL")
            .arg(&key)
            .query_async(&mut *conn)
            .await
            .map_err(|err| ServiceError::InternalServerError(err.to_string()))?
    } else {
        0
    };

    Ok(evaluate_limit(count, limit, ttl_secs, window_secs))
}

async fn increment_counter(
    key: String,
    window_secs: u64,
    redis_pool: &web::Data<RedisPool>,
) -> Result<(), ServiceError> {
    let mut conn = redis_conn(redis_pool).await?;
    let count: i64 = redis::cmd("INCR")
        .arg(&key)
        .query_async(&mut *conn)
        .await
        .map_err(|err| ServiceError::InternalServerError(err.to_string()))?;

    // the window starts with the first message, not the latest one
    if count == 1 {
        redis::cmd("EXPIRE")
            .arg(&key)
            .arg(window_secs)
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|err| ServiceError::InternalServerError(err.to_string()))?;
    }

    Ok(())
}

pub async fn check_session_limit(
    session_id: &str,
    limit: i64,
    redis_pool: &web::Data<RedisPool>,
) -> Result<RateLimitStatus, ServiceError> {
    check_counter(
        format!("{}{}", SESSION_KEY_PREFIX, session_id),
        limit,
        SESSION_LIMIT_TTL_SECONDS,
        redis_pool,
    )
    .await
}

pub async fn check_ip_limit(
    ip_address: &str,
    redis_pool: &web::Data<RedisPool>,
) -> Result<RateLimitStatus, ServiceError> {
    check_counter(
        format!("{}{}", IP_KEY_PREFIX, ip_address),
        DEFAULT_IP_LIMIT,
        IP_LIMIT_TTL_SECONDS,
        redis_pool,
    )
    .await
}

pub async fn increment_session_counter(
    session_id: &str,
    redis_pool: &web::Data<RedisPool>,
) -> Result<(), ServiceError> {
    increment_counter(
        format!("{}{}", SESSION_KEY_PREFIX, session_id),
        SESSION_LIMIT_TTL_SECONDS,
        redis_pool,
    )
    .await
}

pub async fn increment_ip_counter(
    ip_address: &str,
    redis_pool: &web::Data<RedisPool>,
) -> Result<(), ServiceError> {
    increment_counter(
        format!("{}{}", IP_KEY_PREFIX, ip_address),
        IP_LIMIT_TTL_SECONDS,
        redis_pool,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_below_the_cap() {
        let status = evaluate_limit(14, 15, 0, SESSION_LIMIT_TTL_SECONDS);
        assert!(status.allowed);
        assert_eq!(status.remaining, 1);
    }

    #[test]
    fn blocks_once_cap_is_reached() {
        // after exactly N increments the counter equals the cap
        let status = evaluate_limit(15, 15, 1800, SESSION_LIMIT_TTL_SECONDS);
        assert!(!status.allowed);
        assert_eq!(status.remaining, 0);
        assert_eq!(status.retry_after_secs, 1800);
    }

    #[test]
    fn expired_window_starts_fresh() {
        // TTL expiry deletes the key, so the next read sees a zero counter
        let status = evaluate_limit(0, 15, -2, SESSION_LIMIT_TTL_SECONDS);
        assert!(status.allowed);
        assert_eq!(status.remaining, 15);
    }

    #[test]
    fn missing_ttl_never_yields_negative_retry_after() {
        let status = evaluate_limit(50, 50, -1, IP_LIMIT_TTL_SECONDS);
        assert!(!status.allowed);
        assert_eq!(status.retry_after_secs, 0);
    }
}
