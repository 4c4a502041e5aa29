use super::{CounterStore, StoreError};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::{debug, info};

/// Redis-backed counter store shared by every gateway replica
#[derive(Clone)]
pub struct RedisStore {
    /// Redis connection manager (cheap to clone, reconnects on failure)
    connection: ConnectionManager,
}

impl RedisStore {
    /// Connect to Redis and verify the connection
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let connection = ConnectionManager::new(client).await?;
        let mut store = Self { connection };
        store.ping().await?;

        info!("Connected to Redis counter store");
        Ok(store)
    }

    /// Test Redis connection
    pub async fn ping(&mut self) -> Result<(), StoreError> {
        let _: String = redis::cmd("PING").query_async(&mut self.connection).await?;
        Ok(())
    }

    /// Connection handle for scripted operations
    pub(crate) fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn incrby(&self, key: &str, amount: i64) -> Result<i64, StoreError> {
        let mut conn = self.connection();
        let value: i64 = redis::cmd("INCRBY")
            .arg(key)
            .arg(amount)
            .query_async(&mut conn)
            .await?;
        debug!(key, value, "INCRBY");
        Ok(value)
    }

    async fn get_int(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.connection();
        let value: Option<i64> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value.unwrap_or(0))
    }

    async fn ttl(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.connection();
        let ttl: i64 = redis::cmd("TTL").arg(key).query_async(&mut conn).await?;
        Ok(ttl)
    }

    async fn expire(&self, key: &str, ttl_secs: i64) -> Result<(), StoreError> {
        let mut conn = self.connection();
        let _: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: i64, ttl_secs: i64) -> Result<(), StoreError> {
        let mut conn = self.connection();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Note: These tests require a running Redis instance
    // They are ignored by default. Run with: cargo test -- --ignored

    async fn connect() -> RedisStore {
        RedisStore::connect("redis://127.0.0.1:6379")
            .await
            .expect("Failed to connect to Redis")
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_counter_roundtrip() {
        let store = connect().await;
        let key = format!("test-counter-{}", rand::random::<u32>());

        assert_eq!(store.get_int(&key).await.unwrap(), 0);
        assert_eq!(store.ttl(&key).await.unwrap(), -2);

        assert_eq!(store.incrby(&key, 2).await.unwrap(), 2);
        assert_eq!(store.ttl(&key).await.unwrap(), -1);

        store.expire(&key, 60).await.unwrap();
        let ttl = store.ttl(&key).await.unwrap();
        assert!(ttl > 0 && ttl <= 60);

        store.del(&key).await.unwrap();
        assert_eq!(store.get_int(&key).await.unwrap(), 0);
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_set_ex() {
        let store = connect().await;
        let key = format!("test-setex-{}", rand::random::<u32>());

        store.set_ex(&key, 80, 30).await.unwrap();
        assert_eq!(store.get_int(&key).await.unwrap(), 80);
        assert!(store.ttl(&key).await.unwrap() > 0);

        store.del(&key).await.unwrap();
    }
}
