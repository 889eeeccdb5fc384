//! Fixed-window rate limiting keyed by credential id. Counters live in
//! Redis under `rl:<credential_id>:<window_start_epoch>` with a TTL of
//! one window; bursts at window boundaries are an accepted trade-off.

use crate::redis_client::RedisHandle;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub const RATE_LIMIT_PREFIX: &str = "rl:";

#[derive(Debug, Clone, Copy)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: i64,
    pub remaining: i64,
    pub reset_epoch: i64,
}

#[async_trait]
pub trait RateLimiterEngine: Send + Sync {
    async fn check(&self, key: &str, limit: i64, window_seconds: i64) -> Result<RateLimitDecision>;
}

#[derive(Clone)]
pub struct RedisFixedWindowLimiter {
    redis: RedisHandle,
}

impl RedisFixedWindowLimiter {
    pub fn new(redis: RedisHandle) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl RateLimiterEngine for RedisFixedWindowLimiter {
    async fn check(&self, key: &str, limit: i64, window_seconds: i64) -> Result<RateLimitDecision> {
        let now = Utc::now().timestamp();
        let window_start = now - now.rem_euclid(window_seconds);
        let redis_key = format!("{RATE_LIMIT_PREFIX}{key}:{window_start}");

        let mut conn = self.redis.conn().await?;
        let count: i64 = conn.incr(&redis_key, 1).await?;
        // Only the increment that created the key sets the TTL; repeating
        // it on later increments would extend the window.
        if count == 1 {
            let _: () = conn.expire(&redis_key, window_seconds).await?;
        }

        Ok(decision(count, limit, window_start, window_seconds))
    }
}

fn decision(count: i64, limit: i64, window_start: i64, window_seconds: i64) -> RateLimitDecision {
    RateLimitDecision {
        allowed: count <= limit,
        limit,
        remaining: (limit - count).max(0),
        reset_epoch: window_start + window_seconds,
    }
}

/// Test stand-in with the same window semantics, backed by a map of
/// `(window_start, count)` per key.
#[derive(Clone, Default)]
pub struct InMemoryRateLimiter {
    windows: Arc<Mutex<HashMap<String, (i64, i64)>>>,
}

impl InMemoryRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimiterEngine for InMemoryRateLimiter {
    async fn check(&self, key: &str, limit: i64, window_seconds: i64) -> Result<RateLimitDecision> {
        let now = Utc::now().timestamp();
        let window_start = now - now.rem_euclid(window_seconds);

        let mut guard = self.windows.lock().await;
        let entry = guard.entry(key.to_string()).or_insert((window_start, 0));
        if entry.0 != window_start {
            *entry = (window_start, 0);
        }
        entry.1 += 1;

        Ok(decision(entry.1, limit, window_start, window_seconds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_allows_up_to_limit_inclusive() {
        let allowed = decision(2, 2, 0, 60);
        assert!(allowed.allowed);
        assert_eq!(allowed.remaining, 0);

        let denied = decision(3, 2, 0, 60);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_epoch, 60);
    }

    #[test]
    fn decision_reports_remaining_budget() {
        let first = decision(1, 10, 120, 60);
        assert!(first.allowed);
        assert_eq!(first.limit, 10);
        assert_eq!(first.remaining, 9);
        assert_eq!(first.reset_epoch, 180);
    }

    #[tokio::test]
    async fn in_memory_limiter_denies_after_limit() {
        let limiter = InMemoryRateLimiter::new();
        let first = limiter.check("key-a", 2, 3600).await.unwrap();
        let second = limiter.check("key-a", 2, 3600).await.unwrap();
        let third = limiter.check("key-a", 2, 3600).await.unwrap();

        assert!(first.allowed);
        assert!(second.allowed);
        assert!(!third.allowed);
        assert_eq!(third.limit, 2);
        assert_eq!(third.remaining, 0);
    }

    #[tokio::test]
    async fn in_memory_limiter_tracks_keys_independently() {
        let limiter = InMemoryRateLimiter::new();
        let _ = limiter.check("key-a", 1, 3600).await.unwrap();
        let other = limiter.check("key-b", 1, 3600).await.unwrap();
        assert!(other.allowed);
    }
}
