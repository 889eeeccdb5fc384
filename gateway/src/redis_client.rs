use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Lazily-initialized Redis client shared across the process. Creating
/// the handle only validates the URL; the managed connection is
/// established on first use and cloned afterwards.
#[derive(Clone)]
pub struct RedisHandle {
    inner: Arc<RedisHandleInner>,
}

struct RedisHandleInner {
    client: redis::Client,
    manager: OnceCell<ConnectionManager>,
}

impl RedisHandle {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        Ok(Self {
            inner: Arc::new(RedisHandleInner {
                client,
                manager: OnceCell::new(),
            }),
        })
    }

    pub async fn conn(&self) -> Result<ConnectionManager> {
        let manager = self
            .inner
            .manager
            .get_or_try_init(|| ConnectionManager::new(self.inner.client.clone()))
            .await
            .context("Failed to create Redis connection manager")?;
        Ok(manager.clone())
    }
}
