use std::sync::Arc;

use sqlx::PgPool;

use crate::blocklist::BlocklistStore;
use crate::config::GatewayConfig;
use crate::metrics::GatewayMetrics;
use crate::rate_limit::{RateLimiterEngine, RedisFixedWindowLimiter};
use crate::redis_client::RedisHandle;

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub redis: RedisHandle,
    pub rate_limiter: Arc<dyn RateLimiterEngine>,
    pub blocklist: BlocklistStore,
    pub config: Arc<GatewayConfig>,
    pub metrics: Arc<GatewayMetrics>,
}

impl AppState {
    pub fn new(
        db: PgPool,
        redis: RedisHandle,
        config: Arc<GatewayConfig>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        let rate_limiter = Arc::new(RedisFixedWindowLimiter::new(redis.clone()));
        let blocklist = BlocklistStore::new(redis.clone());
        Self {
            db,
            redis,
            rate_limiter,
            blocklist,
            config,
            metrics,
        }
    }

    /// Swap the rate-limit engine (tests use the in-memory one).
    pub fn with_rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiterEngine>) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    /// Per-key overrides win; NULL columns fall back to process defaults.
    pub fn effective_limits(&self, key_limit: Option<i32>, key_window: Option<i32>) -> (i64, i64) {
        (
            key_limit.unwrap_or(self.config.rate_limit_requests) as i64,
            key_window.unwrap_or(self.config.rate_limit_window_seconds) as i64,
        )
    }
}
