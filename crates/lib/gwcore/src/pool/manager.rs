use super::{Pool, PooledClient};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::error;

/// A pool handle erased of its concrete client type, so pools of different
/// client types can share one registry.
#[async_trait]
trait ErasedPool: Send + Sync {
    async fn close(&self) -> Result<()>;
}

#[async_trait]
impl<T: PooledClient> ErasedPool for Pool<T> {
    async fn close(&self) -> Result<()> {
        Pool::close(self).await
    }
}

/// Named registry of pools with uniform shutdown.
///
/// Re-registration under an existing name closes the prior entry first.
#[derive(Default)]
pub struct PoolManager {
    pools: RwLock<HashMap<String, Box<dyn ErasedPool>>>,
}

impl PoolManager {
    pub fn new() -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Register `pool` under `name`, closing and replacing any prior entry.
    pub async fn register<T: PooledClient>(&self, name: impl Into<String>, pool: Pool<T>) {
        let name = name.into();
        let mut pools = self.pools.write().await;
        if let Some(prior) = pools.insert(name, Box::new(pool)) {
            if let Err(err) = prior.close().await {
                error!(error = %err, "failed closing replaced pool");
            }
        }
    }

    /// Close and remove the named pool, if present.
    pub async fn deregister(&self, name: &str) -> Result<()> {
        let mut pools = self.pools.write().await;
        if let Some(pool) = pools.remove(name) {
            pool.close().await?;
        }
        Ok(())
    }

    /// Close every registered pool. Individual failures are logged; the
    /// sweep never aborts early.
    pub async fn close_all(&self) {
        let mut pools = self.pools.write().await;
        for (name, pool) in pools.drain() {
            if let Err(err) = pool.close().await {
                error!(pool = %name, error = %err, "failed closing pool");
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.pools.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use tokio::time::Instant;

    struct Dummy;

    #[async_trait]
    impl PooledClient for Dummy {
        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
        async fn is_healthy(&self, _deadline: Instant) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn register_replaces_and_closes_prior() {
        let manager = PoolManager::new();
        let pool = Pool::new(PoolConfig::default(), || async { Ok(Dummy) })
            .await
            .unwrap();
        manager.register("svc", pool.clone()).await;
        assert_eq!(manager.len().await, 1);

        let pool2 = Pool::new(PoolConfig::default(), || async { Ok(Dummy) })
            .await
            .unwrap();
        manager.register("svc", pool2).await;
        assert_eq!(manager.len().await, 1);

        manager.close_all().await;
        assert_eq!(manager.len().await, 0);
    }
}
